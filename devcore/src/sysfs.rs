//! Presentation surfaces the core publishes into.
//!
//! The core never owns a filesystem. It drives three collaborator traits ([AttrPublisher],
//! [LinkPublisher], [Notifier]) and keeps a [PublishLog] of everything it created so a failed
//! registration can be unwound most recent first. [MemSysfs] is an in-memory backend with fault
//! injection.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Debug, Display},
    sync::Arc,
};

use bitflags::bitflags;
use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use spin::Mutex;

use crate::{
    dev::Device,
    error::{AttrError, PublishError},
    kobj::{KobjWeak, Namespace},
};

bitflags! {
    pub struct AttrMode: u16 {
        const USR_R = 0o400;
        const USR_W = 0o200;
        const USR_X = 0o100;
        const GRP_R = 0o040;
        const GRP_W = 0o020;
        const GRP_X = 0o010;
        const OTH_R = 0o004;
        const OTH_W = 0o002;
        const OTH_X = 0o001;

        const RUGO = Self::USR_R.bits | Self::GRP_R.bits | Self::OTH_R.bits;
        const WUGO = Self::USR_W.bits | Self::GRP_W.bits | Self::OTH_W.bits;
        const READ = Self::RUGO.bits;
        const WRITE = Self::WUGO.bits;
    }
}

pub type ShowFn = fn(&Device) -> String;
pub type StoreFn = fn(&Device, &str) -> Result<usize, AttrError>;

/// A named value exposed on a device node.
#[derive(Clone)]
pub struct Attribute {
    pub name: &'static str,
    pub mode: AttrMode,
    pub show: Option<ShowFn>,
    pub store: Option<StoreFn>,
}

impl Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("mode", &format_args!("{:#o}", self.mode.bits()))
            .field("show", &self.show.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl Attribute {
    pub const fn new(name: &'static str, mode: AttrMode) -> Self {
        Self {
            name,
            mode,
            show: None,
            store: None,
        }
    }

    pub const fn with_show(mut self, show: ShowFn) -> Self {
        self.show = Some(show);
        self
    }

    pub const fn with_store(mut self, store: StoreFn) -> Self {
        self.store = Some(store);
        self
    }
}

/// Attributes published together, optionally in a subdirectory of the device node.
#[derive(Clone, Default)]
pub struct AttributeGroup {
    pub name: Option<&'static str>,
    pub attrs: Vec<Attribute>,
    /// Effective mode per attribute; an empty mode hides it.
    pub is_visible: Option<fn(&Device, &Attribute) -> AttrMode>,
}

impl Debug for AttributeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeGroup")
            .field("name", &self.name)
            .field("attrs", &self.attrs)
            .finish_non_exhaustive()
    }
}

pub trait AttrPublisher: Send + Sync {
    fn create_file(&self, node: &str, attr: &Attribute) -> Result<(), PublishError>;
    fn remove_file(&self, node: &str, attr: &Attribute);
}

pub trait LinkPublisher: Send + Sync {
    /// Create `<parent>/<name>` pointing at `target`.
    fn create_link(&self, parent: &str, target: &str, name: &str) -> Result<(), PublishError>;
    fn remove_link(&self, parent: &str, name: &str);
}

pub trait Notifier: Send + Sync {
    /// Fire and forget. The result only decides what gets logged.
    fn broadcast(&self, event: &Event, dev: &Device) -> Result<(), PublishError>;
}

/// Bus notifier codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum BusEvent {
    AddDevice = 1,
    DelDevice = 2,
    BindDriver = 3,
    BoundDriver = 4,
    UnbindDriver = 5,
    UnboundDriver = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KobjAction {
    Add,
    Remove,
    Change,
    Bind,
    Unbind,
}

impl KobjAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Change => "change",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
        }
    }
}

impl core::str::FromStr for KobjAction {
    type Err = AttrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            "change" => Ok(Self::Change),
            "bind" => Ok(Self::Bind),
            "unbind" => Ok(Self::Unbind),
            _ => Err(AttrError::Invalid),
        }
    }
}

/// `KEY=value` environment attached to a uevent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UeventEnv {
    vars: Vec<(Box<str>, String)>,
}

impl UeventEnv {
    pub fn add(&mut self, key: &str, value: impl Display) {
        self.vars.push((Box::from(key), value.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn extend(&mut self, other: UeventEnv) {
        self.vars.extend(other.vars);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (&**k, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl Display for UeventEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            writeln!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Bus(BusEvent),
    Uevent { action: KobjAction, env: UeventEnv },
}

/// The collaborator set a [DeviceCore](crate::dev::DeviceCore) publishes through.
#[derive(Clone)]
pub struct Collaborators {
    pub files: Arc<dyn AttrPublisher>,
    pub links: Arc<dyn LinkPublisher>,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Arc::new(MemSysfs::new()).collaborators()
    }
}

impl Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Collaborators")
    }
}

// region: publish log

pub(crate) enum Published {
    Node(KobjWeak),
    File { node: Box<str>, attr: Attribute },
    Link { parent: Box<str>, name: Box<str> },
}

/// Side effects of a registration, in creation order.
#[derive(Default)]
pub(crate) struct PublishLog {
    steps: Vec<Published>,
}

impl PublishLog {
    pub fn node(&mut self, node: KobjWeak) {
        self.steps.push(Published::Node(node));
    }

    pub fn file(&mut self, node: &str, attr: &Attribute) {
        self.steps.push(Published::File {
            node: Box::from(node),
            attr: attr.clone(),
        });
    }

    pub fn link(&mut self, parent: &str, name: &str) {
        self.steps.push(Published::Link {
            parent: Box::from(parent),
            name: Box::from(name),
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Undo everything recorded after the first `keep` steps, most recent first.
    pub fn unwind_to(&mut self, keep: usize, ns: &Namespace, collab: &Collaborators) {
        while self.steps.len() > keep {
            let Some(step) = self.steps.pop() else {
                break;
            };
            match step {
                Published::Node(node) => {
                    if let Some(node) = node.upgrade() {
                        ns.unpublish(&node);
                    }
                }
                Published::File { node, attr } => collab.files.remove_file(&node, &attr),
                Published::Link { parent, name } => collab.links.remove_link(&parent, &name),
            }
        }
    }

    pub fn unwind(&mut self, ns: &Namespace, collab: &Collaborators) {
        self.unwind_to(0, ns, collab)
    }
}

// endregion

// region: attribute helpers

fn check_mode(attr: &Attribute) {
    if attr.mode.intersects(AttrMode::WRITE) && attr.store.is_none() {
        warn!("Attribute {}: write permission without 'store'", attr.name);
    }
    if attr.mode.intersects(AttrMode::READ) && attr.show.is_none() {
        warn!("Attribute {}: read permission without 'show'", attr.name);
    }
}

/// Publish `attrs` on `node`, recording each file in `log`. The caller unwinds on error.
pub(crate) fn create_files(
    collab: &Collaborators,
    log: &mut PublishLog,
    node: &str,
    attrs: &[Attribute],
) -> Result<(), PublishError> {
    for attr in attrs {
        check_mode(attr);
        collab.files.create_file(node, attr)?;
        log.file(node, attr);
    }
    Ok(())
}

pub(crate) fn create_groups(
    collab: &Collaborators,
    log: &mut PublishLog,
    node: &str,
    dev: &Device,
    groups: &[AttributeGroup],
) -> Result<(), PublishError> {
    for group in groups {
        let dir = match group.name {
            Some(name) => format!("{}/{}", node, name),
            None => String::from(node),
        };
        for attr in &group.attrs {
            let mut attr = attr.clone();
            if let Some(is_visible) = group.is_visible {
                attr.mode = is_visible(dev, &attr);
                if attr.mode.is_empty() {
                    continue;
                }
            }
            check_mode(&attr);
            collab.files.create_file(&dir, &attr)?;
            log.file(&dir, &attr);
        }
    }
    Ok(())
}

/// Read `attr` of `dev`; missing `show` is an I/O error.
pub fn attr_show(dev: &Device, attr: &Attribute) -> Result<String, AttrError> {
    attr.show.map(|show| show(dev)).ok_or(AttrError::Io)
}

pub fn attr_store(dev: &Device, attr: &Attribute, buf: &str) -> Result<usize, AttrError> {
    let store = attr.store.ok_or(AttrError::Io)?;
    store(dev, buf)
}

// endregion

// region: in-memory backend

/// Collaborator call that [MemSysfs] should fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail `create_file` for attributes with this name.
    File(&'static str),
    /// Fail `create_link` for links with this name.
    Link(&'static str),
}

/// In-memory publishing backend.
#[derive(Debug, Default)]
pub struct MemSysfs {
    files: Mutex<BTreeSet<String>>,
    links: Mutex<BTreeMap<String, String>>,
    events: Mutex<Vec<(Box<str>, Event)>>,
    faults: Mutex<Vec<Fault>>,
}

impl MemSysfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            files: self.clone(),
            links: self.clone(),
            notifier: self.clone(),
        }
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.lock().contains(path)
    }

    pub fn has_link(&self, path: &str) -> bool {
        self.links.lock().contains_key(path)
    }

    pub fn link_target(&self, path: &str) -> Option<String> {
        self.links.lock().get(path).cloned()
    }

    pub fn files(&self) -> Vec<String> {
        self.files.lock().iter().cloned().collect()
    }

    pub fn links(&self) -> Vec<(String, String)> {
        self.links
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Events seen so far, tagged with the device name.
    pub fn events(&self) -> Vec<(Box<str>, Event)> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }
}

impl AttrPublisher for MemSysfs {
    fn create_file(&self, node: &str, attr: &Attribute) -> Result<(), PublishError> {
        if self.faults.lock().contains(&Fault::File(attr.name)) {
            return Err(PublishError::Failed {
                reason: "injected file fault",
            });
        }
        let path = format!("{}/{}", node, attr.name);
        let mut files = self.files.lock();
        if files.contains(&path) {
            return Err(PublishError::Exists { path: path.into() });
        }
        files.insert(path);
        Ok(())
    }

    fn remove_file(&self, node: &str, attr: &Attribute) {
        let path = format!("{}/{}", node, attr.name);
        if !self.files.lock().remove(&path) {
            warn!("MemSysfs: removing missing file {}", path);
        }
    }
}

impl LinkPublisher for MemSysfs {
    fn create_link(&self, parent: &str, target: &str, name: &str) -> Result<(), PublishError> {
        let faulted = self
            .faults
            .lock()
            .iter()
            .any(|f| matches!(f, Fault::Link(n) if *n == name));
        if faulted {
            return Err(PublishError::Failed {
                reason: "injected link fault",
            });
        }
        let path = format!("{}/{}", parent, name);
        let mut links = self.links.lock();
        if links.contains_key(&path) {
            return Err(PublishError::Exists { path: path.into() });
        }
        links.insert(path, String::from(target));
        Ok(())
    }

    fn remove_link(&self, parent: &str, name: &str) {
        let path = format!("{}/{}", parent, name);
        if self.links.lock().remove(&path).is_none() {
            warn!("MemSysfs: removing missing link {}", path);
        }
    }
}

impl Notifier for MemSysfs {
    fn broadcast(&self, event: &Event, dev: &Device) -> Result<(), PublishError> {
        self.events.lock().push((dev.name(), event.clone()));
        Ok(())
    }
}

// endregion
