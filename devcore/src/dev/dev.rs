//! Device objects.
//!
//! A [Device] is a [Kobject] plus everything the driver core tracks about it: bus, class,
//! type descriptor, device number, bound driver and its managed-resource list. Devices are built
//! with [DeviceBuilder], owned through [Handle<Device>] and registered with
//! [DeviceCore::device_add](crate::dev::DeviceCore::device_add).
//!
//! Teardown happens in `Drop`, i.e. exactly once when the last handle goes away: every devres
//! entry is released first (most recent first), then the most specific release handler runs
//! (device, else type, else class).
use core::{
    any::Any,
    fmt::{self, Debug, Display},
    str::FromStr,
};
use std::sync::{
    Arc, MutexGuard, PoisonError, Weak,
    atomic::{AtomicBool, Ordering},
};

use log::{debug, error};
use spin::{Mutex, RwLock};
use utils::{impl_conversion, vec::LockedVec};

use crate::{
    dev::{
        DeviceCore,
        bus::Bus,
        class::{Class, GlueDir},
        devres::DevresList,
        driver::DeviceDriver,
    },
    error::{AttrError, DevError},
    kobj::{Handle, HandleRef, Kobj, Kobject},
    sysfs::{AttrMode, Attribute, AttributeGroup, KobjAction, PublishLog, UeventEnv},
};

pub type ReleaseFn = Box<dyn Fn(&Device) + Send + Sync>;
pub type UeventFn = fn(&Device, &mut UeventEnv) -> Result<(), DevError>;
pub type DevnodeFn = fn(&Device) -> Option<DevNode>;

// region: device numbers

pub const MINOR_BITS: u32 = 8;
pub const MINOR_MASK: u32 = (1 << MINOR_BITS) - 1;

/// Device number: major in the high bits, 8-bit minor in the low bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DevT {
    inner: u32,
}
impl_conversion!(DevT, u32);

impl DevT {
    pub const NONE: DevT = DevT { inner: 0 };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self {
            inner: (major << MINOR_BITS) | (minor & MINOR_MASK),
        }
    }

    pub const fn major(&self) -> u32 {
        self.inner >> MINOR_BITS
    }

    pub const fn minor(&self) -> u32 {
        self.inner & MINOR_MASK
    }
}

impl Display for DevT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

impl Debug for DevT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevT({})", self)
    }
}

// endregion

/// Device node name relative to the device directory, plus an optional mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevNode {
    pub name: String,
    pub mode: Option<u16>,
}

/// Behaviour shared by a family of devices.
#[derive(Default)]
pub struct DeviceType {
    pub name: Option<&'static str>,
    pub groups: Vec<AttributeGroup>,
    pub uevent: Option<UeventFn>,
    pub devnode: Option<DevnodeFn>,
    pub release: Option<ReleaseFn>,
}

impl Debug for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceType")
            .field("name", &self.name)
            .field("release", &self.release.is_some())
            .finish_non_exhaustive()
    }
}

/// Core-private per-device bookkeeping.
pub(crate) struct DevicePrivate {
    pub children: LockedVec<Handle<Device>>,
    /// Everything `device_add` published, unwound by `device_del`.
    pub published: Mutex<PublishLog>,
    pub glue: Mutex<Option<Handle<GlueDir>>>,
    pub core: RwLock<Weak<DeviceCore>>,
    /// Set under the device lock once `device_del` has started; no driver binds afterwards.
    pub dead: AtomicBool,
}

pub struct Device {
    kobj: Kobject,
    init_name: Option<Box<str>>,
    parent: Option<HandleRef<Device>>,
    bus: Option<Arc<Bus>>,
    class: Option<Arc<Class>>,
    dev_type: Option<Arc<DeviceType>>,
    devt: DevT,
    id: Option<u32>,
    groups: Vec<AttributeGroup>,
    release: Option<ReleaseFn>,
    pub(crate) driver: RwLock<Option<Arc<DeviceDriver>>>,
    driver_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    pub(crate) devres: Mutex<DevresList>,
    pub(crate) p: DevicePrivate,
    /// Serializes attach and release of a driver. Held across probe and remove callbacks, so it
    /// blocks instead of spinning.
    lock: std::sync::Mutex<()>,
}

impl Kobj for Device {
    fn kobj(&self) -> &Kobject {
        &self.kobj
    }
}

impl Device {
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::default()
    }

    /// Current name: the published name, else the provisional one, else empty.
    pub fn name(&self) -> Box<str> {
        self.kobj
            .name()
            .or_else(|| self.init_name.clone())
            .unwrap_or_default()
    }

    pub(crate) fn init_name(&self) -> Option<&str> {
        self.init_name.as_deref()
    }

    pub fn path(&self) -> Option<Box<str>> {
        self.kobj.path()
    }

    pub fn is_registered(&self) -> bool {
        self.kobj.is_published()
    }

    /// Registered and not on its way out. Checked with the device lock held.
    pub(crate) fn is_bindable(&self) -> bool {
        self.is_registered() && !self.p.dead.load(Ordering::Acquire)
    }

    /// Take the device lock. A panicking probe does not wedge the device.
    pub(crate) fn lock_device(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn parent(&self) -> Option<Handle<Device>> {
        self.parent.as_ref().and_then(HandleRef::get_handle)
    }

    pub(crate) fn parent_ref(&self) -> Option<&HandleRef<Device>> {
        self.parent.as_ref()
    }

    /// Glue directory this device is published under, if any.
    pub fn glue_dir(&self) -> Option<Handle<GlueDir>> {
        self.p.glue.lock().clone()
    }

    pub fn bus(&self) -> Option<&Arc<Bus>> {
        self.bus.as_ref()
    }

    pub fn class(&self) -> Option<&Arc<Class>> {
        self.class.as_ref()
    }

    pub fn dev_type(&self) -> Option<&Arc<DeviceType>> {
        self.dev_type.as_ref()
    }

    pub fn devt(&self) -> DevT {
        self.devt
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn groups(&self) -> &[AttributeGroup] {
        &self.groups
    }

    pub fn driver(&self) -> Option<Arc<DeviceDriver>> {
        self.driver.read().clone()
    }

    pub fn children(&self) -> Vec<Handle<Device>> {
        self.p.children.snapshot()
    }

    pub(crate) fn core(&self) -> Option<Arc<DeviceCore>> {
        self.p.core.read().upgrade()
    }

    pub fn set_drvdata<T: Any + Send + Sync>(&self, data: T) {
        *self.driver_data.lock() = Some(Box::new(data));
    }

    /// Run `f` on the driver data if it is present and of type `T`.
    pub fn with_drvdata<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.driver_data.lock();
        guard.as_ref()?.downcast_ref::<T>().map(f)
    }

    pub fn take_drvdata(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.driver_data.lock().take()
    }

    /// Device node name: type hook, else class hook, else the name with `!` mapped to `/`.
    pub fn devnode(&self) -> DevNode {
        let hooked = self
            .dev_type
            .as_ref()
            .and_then(|t| t.devnode)
            .and_then(|devnode| devnode(self))
            .or_else(|| {
                self.class
                    .as_ref()
                    .and_then(|c| c.devnode())
                    .and_then(|devnode| devnode(self))
            });
        hooked.unwrap_or_else(|| DevNode {
            name: self.name().replace('!', "/"),
            mode: None,
        })
    }

    /// Only devices on a bus or in a class emit uevents.
    pub fn uevent_filter(&self) -> bool {
        self.bus.is_some() || self.class.is_some()
    }

    pub fn uevent_subsystem(&self) -> Option<&'static str> {
        self.bus
            .as_ref()
            .map(|bus| bus.name())
            .or_else(|| self.class.as_ref().map(|class| class.name()))
    }

    /// Environment for a uevent of this device. Hook failures are logged and skipped.
    pub fn uevent_env(&self) -> UeventEnv {
        let mut env = UeventEnv::default();
        if self.devt.major() != 0 {
            env.add("MAJOR", self.devt.major());
            env.add("MINOR", self.devt.minor());
            let node = self.devnode();
            env.add("DEVNAME", &node.name);
            if let Some(mode) = node.mode {
                env.add("DEVMODE", format_args!("0{:o}", mode));
            }
        }
        if let Some(name) = self.dev_type.as_ref().and_then(|t| t.name) {
            env.add("DEVTYPE", name);
        }
        if let Some(driver) = self.driver() {
            env.add("DRIVER", driver.name());
        }

        let hooks = [
            ("bus", self.bus.as_ref().and_then(|b| b.uevent_hook())),
            ("class", self.class.as_ref().and_then(|c| c.uevent_hook())),
            ("dev_type", self.dev_type.as_ref().and_then(|t| t.uevent)),
        ];
        for (source, hook) in hooks {
            if let Some(hook) = hook {
                if let Err(err) = hook(self, &mut env) {
                    debug!(
                        "device: '{}': dev_uevent: {} uevent() returned {}",
                        self.name(),
                        source,
                        err
                    );
                }
            }
        }
        env
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("path", &self.path())
            .field("devt", &self.devt)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(err) = self.devres_release_all() {
            error!("Device '{}': devres not released: {}", self.name(), err);
        }
        let release = self
            .release
            .as_ref()
            .or_else(|| self.dev_type.as_ref().and_then(|t| t.release.as_ref()))
            .or_else(|| self.class.as_ref().and_then(|c| c.dev_release()));
        match release {
            Some(release) => release(self),
            None => error!(
                "Device '{}' does not have a release() function, it is broken and must be fixed.",
                self.name()
            ),
        }
    }
}

// region: default attributes

fn uevent_show(dev: &Device) -> String {
    dev.uevent_env().to_string()
}

fn uevent_store(dev: &Device, buf: &str) -> Result<usize, AttrError> {
    let action = KobjAction::from_str(buf.trim())?;
    let core = dev.core().ok_or(AttrError::Io)?;
    core.kobject_uevent(dev, action);
    Ok(buf.len())
}

fn dev_show(dev: &Device) -> String {
    format!("{}\n", dev.devt)
}

pub(crate) fn uevent_attr() -> Attribute {
    Attribute::new("uevent", AttrMode::USR_R | AttrMode::USR_W | AttrMode::GRP_R | AttrMode::OTH_R)
        .with_show(uevent_show)
        .with_store(uevent_store)
}

pub(crate) fn dev_attr() -> Attribute {
    Attribute::new("dev", AttrMode::RUGO).with_show(dev_show)
}

// endregion

/// Builder for an unregistered [Device].
#[derive(Default)]
pub struct DeviceBuilder {
    init_name: Option<Box<str>>,
    parent: Option<HandleRef<Device>>,
    bus: Option<Arc<Bus>>,
    class: Option<Arc<Class>>,
    dev_type: Option<Arc<DeviceType>>,
    devt: DevT,
    id: Option<u32>,
    groups: Vec<AttributeGroup>,
    release: Option<ReleaseFn>,
    driver: Option<Arc<DeviceDriver>>,
}

impl DeviceBuilder {
    /// Provisional name, promoted when the device is added.
    pub fn name(mut self, name: impl AsRef<str>) -> Self {
        self.init_name = Some(Box::from(name.as_ref()));
        self
    }

    pub fn parent(mut self, parent: &Handle<Device>) -> Self {
        self.parent = Some(parent.create_ref());
        self
    }

    pub fn bus(mut self, bus: &Arc<Bus>) -> Self {
        self.bus = Some(bus.clone());
        self
    }

    pub fn class(mut self, class: &Arc<Class>) -> Self {
        self.class = Some(class.clone());
        self
    }

    pub fn dev_type(mut self, dev_type: &Arc<DeviceType>) -> Self {
        self.dev_type = Some(dev_type.clone());
        self
    }

    pub fn devt(mut self, devt: DevT) -> Self {
        self.devt = devt;
        self
    }

    /// Instance number used with the bus's `dev_name` when no name is given.
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    pub fn group(mut self, group: AttributeGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn release(mut self, release: impl Fn(&Device) + Send + Sync + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// Bind to `driver` directly on attach instead of matching.
    pub fn driver(mut self, driver: &Arc<DeviceDriver>) -> Self {
        self.driver = Some(driver.clone());
        self
    }

    pub fn build(self) -> Handle<Device> {
        Handle::from(Device {
            kobj: Kobject::new(),
            init_name: self.init_name,
            parent: self.parent,
            bus: self.bus,
            class: self.class,
            dev_type: self.dev_type,
            devt: self.devt,
            id: self.id,
            groups: self.groups,
            release: self.release,
            driver: RwLock::new(self.driver),
            driver_data: Mutex::new(None),
            devres: Mutex::new(DevresList::new()),
            p: DevicePrivate {
                children: LockedVec::new(),
                published: Mutex::new(PublishLog::default()),
                glue: Mutex::new(None),
                core: RwLock::new(Weak::new()),
                dead: AtomicBool::new(false),
            },
            lock: std::sync::Mutex::new(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn devt_layout() {
        let devt = DevT::new(4, 65);
        assert_eq!(u32::from(devt), (4 << 8) | 65);
        assert_eq!(devt.major(), 4);
        assert_eq!(devt.minor(), 65);
        assert_eq!(devt.to_string(), "4:65");
        assert_eq!(DevT::new(1, 0x1ff).minor(), 0xff);
    }

    #[test]
    fn provisional_name_is_visible_before_add() {
        let dev = Device::builder().name("ttyS0").release(|_| {}).build();
        assert_eq!(&*dev.name(), "ttyS0");
        assert!(!dev.is_registered());
    }

    #[test]
    fn devnode_maps_bang_to_slash() {
        let dev = Device::builder().name("cciss!c0d0").release(|_| {}).build();
        assert_eq!(dev.devnode().name, "cciss/c0d0");
    }

    #[test]
    fn devnode_prefers_type_hook() {
        let dev_type = Arc::new(DeviceType {
            name: Some("partition"),
            devnode: Some(|_| {
                Some(DevNode {
                    name: String::from("disk/p1"),
                    mode: Some(0o600),
                })
            }),
            ..Default::default()
        });
        let dev = Device::builder()
            .name("p1")
            .devt(DevT::new(8, 1))
            .dev_type(&dev_type)
            .release(|_| {})
            .build();
        let env = dev.uevent_env();
        assert_eq!(env.get("MAJOR"), Some("8"));
        assert_eq!(env.get("MINOR"), Some("1"));
        assert_eq!(env.get("DEVNAME"), Some("disk/p1"));
        assert_eq!(env.get("DEVMODE"), Some("0600"));
        assert_eq!(env.get("DEVTYPE"), Some("partition"));
        assert_eq!(env.get("DRIVER"), None);
    }

    #[test]
    fn release_prefers_device_then_type() {
        static DEVICE: AtomicUsize = AtomicUsize::new(0);
        static TYPE: AtomicUsize = AtomicUsize::new(0);
        let dev_type = Arc::new(DeviceType {
            release: Some(Box::new(|_| {
                TYPE.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });

        let dev = Device::builder()
            .name("a")
            .dev_type(&dev_type)
            .release(|_| {
                DEVICE.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        dev.release();
        assert_eq!(DEVICE.load(Ordering::SeqCst), 1);
        assert_eq!(TYPE.load(Ordering::SeqCst), 0);

        Device::builder().name("b").dev_type(&dev_type).build().release();
        assert_eq!(TYPE.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_release_handler_is_not_fatal() {
        let dev = Device::builder().name("orphan").build();
        drop(dev);
    }

    #[test]
    fn drvdata_is_typed() {
        let dev = Device::builder().name("a").release(|_| {}).build();
        dev.set_drvdata(42u32);
        assert_eq!(dev.with_drvdata(|v: &u32| *v), Some(42));
        assert_eq!(dev.with_drvdata(|v: &u64| *v), None);
        assert!(dev.take_drvdata().is_some());
    }
}
