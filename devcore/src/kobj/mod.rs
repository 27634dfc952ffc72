//! Object registry: the reference-counted node every hierarchy entry is built on.
//!
//! A [Kobject] carries a name, a weak back-reference to its parent and the path it is published
//! under. Objects embed one and implement [Kobj]; ownership goes through
//! [Handle](handle::Handle), so the release path is whatever `Drop` the embedding type defines.

pub mod handle;
pub mod namespace;

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use spin::{Mutex, RwLock};

use crate::error::KobjError;

pub use handle::{Handle, HandleRef};
pub use namespace::Namespace;

bitflags! {
    pub struct KobjState: u8 {
        const INITIALIZED = 1 << 0;
        const IN_HIERARCHY = 1 << 1;
        const ADD_EVENT_SENT = 1 << 2;
        const REMOVE_EVENT_SENT = 1 << 3;
    }
}

/// Anything that lives in the hierarchy.
pub trait Kobj: Send + Sync {
    fn kobj(&self) -> &Kobject;
}

pub type KobjPtr = Arc<dyn Kobj>;
pub type KobjWeak = Weak<dyn Kobj>;

pub struct Kobject {
    name: RwLock<Option<Box<str>>>,
    parent: RwLock<Option<KobjWeak>>,
    path: RwLock<Option<Box<str>>>,
    state: Mutex<KobjState>,
}

impl Kobject {
    pub fn new() -> Self {
        Self {
            name: RwLock::new(None),
            parent: RwLock::new(None),
            path: RwLock::new(None),
            state: Mutex::new(KobjState::INITIALIZED),
        }
    }

    /// Unpublished node named `name`. The name is not validated until publication.
    pub fn with_name(name: impl AsRef<str>) -> Self {
        let kobj = Self::new();
        *kobj.name.write() = Some(Box::from(name.as_ref()));
        kobj
    }

    pub fn name(&self) -> Option<Box<str>> {
        self.name.read().clone()
    }

    /// Rename the node. Only legal before it is published.
    pub fn set_name(&self, name: &str) -> Result<(), KobjError> {
        validate_name(name)?;
        let state = self.state.lock();
        if state.contains(KobjState::IN_HIERARCHY) {
            return Err(KobjError::AlreadyPublished);
        }
        *self.name.write() = Some(Box::from(name));
        Ok(())
    }

    pub fn parent(&self) -> Option<KobjPtr> {
        self.parent.read().as_ref().and_then(Weak::upgrade)
    }

    /// Full path, present only while published.
    pub fn path(&self) -> Option<Box<str>> {
        self.path.read().clone()
    }

    pub fn is_published(&self) -> bool {
        self.state().contains(KobjState::IN_HIERARCHY)
    }

    pub fn state(&self) -> KobjState {
        *self.state.lock()
    }

    pub(crate) fn mark(&self, flags: KobjState) {
        self.state.lock().insert(flags);
    }

    pub(crate) fn attach(&self, path: Box<str>, parent: Option<KobjWeak>) {
        let mut state = self.state.lock();
        *self.path.write() = Some(path);
        *self.parent.write() = parent;
        state.insert(KobjState::IN_HIERARCHY);
        state.remove(KobjState::ADD_EVENT_SENT | KobjState::REMOVE_EVENT_SENT);
    }

    pub(crate) fn detach(&self) {
        let mut state = self.state.lock();
        *self.path.write() = None;
        *self.parent.write() = None;
        state.remove(KobjState::IN_HIERARCHY);
    }
}

impl Default for Kobject {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Kobject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kobject")
            .field("name", &self.name())
            .field("path", &self.path())
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), KobjError> {
    if name.is_empty() || name.contains('/') {
        return Err(KobjError::InvalidName);
    }
    Ok(())
}

/// Whether `a` and `b` are the same node.
pub fn same_node(a: &KobjPtr, b: &KobjPtr) -> bool {
    core::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// A plain directory node: hierarchy roots, bus and class directories.
#[derive(Debug)]
pub struct KobjDir {
    kobj: Kobject,
}

impl Kobj for KobjDir {
    fn kobj(&self) -> &Kobject {
        &self.kobj
    }
}

impl KobjDir {
    pub fn new(name: impl AsRef<str>) -> Handle<KobjDir> {
        Handle::from(KobjDir {
            kobj: Kobject::with_name(name),
        })
    }
}
