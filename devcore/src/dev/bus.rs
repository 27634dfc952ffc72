//! Buses: device and driver lists plus the match/probe/remove hooks shared by both sides.
use core::{
    fmt::{self, Debug},
    sync::atomic::{AtomicBool, Ordering},
};
use std::sync::Arc;

use log::info;
use spin::RwLock;
use utils::vec::LockedVec;

use crate::{
    dev::{Device, DeviceCore, UeventFn, driver::DeviceDriver, driver::DriverProbeError},
    error::DevError,
    kobj::{Handle, HandleRef, Kobj, KobjDir},
    sysfs::{self, Attribute, PublishLog},
};

pub type MatchFn = fn(&Device, &DeviceDriver) -> bool;
pub type ProbeFn = fn(&Handle<Device>) -> Result<(), DriverProbeError>;
pub type RemoveFn = fn(&Handle<Device>);

/// Static description of a bus.
#[derive(Default)]
pub struct BusType {
    pub name: &'static str,
    /// Devices without a name are enumerated as `<dev_name><id>`.
    pub dev_name: Option<&'static str>,
    pub dev_attrs: Vec<Attribute>,
    pub match_fn: Option<MatchFn>,
    pub uevent: Option<UeventFn>,
    /// Runs instead of the driver's own probe when present.
    pub probe: Option<ProbeFn>,
    pub remove: Option<RemoveFn>,
}

impl BusType {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }
}

/// A registered bus.
pub struct Bus {
    desc: BusType,
    drivers_autoprobe: AtomicBool,
    pub(crate) drivers: LockedVec<Arc<DeviceDriver>>,
    pub(crate) devices: LockedVec<Handle<Device>>,
    dev_root: RwLock<Option<HandleRef<Device>>>,
    pub(crate) dir: Handle<KobjDir>,
    pub(crate) devices_dir: Handle<KobjDir>,
    pub(crate) drivers_dir: Handle<KobjDir>,
}

impl Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.desc.name)
            .field("drivers", &self.drivers.len())
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl Bus {
    fn new(desc: BusType, autoprobe: bool) -> Self {
        Self {
            dir: KobjDir::new(desc.name),
            devices_dir: KobjDir::new("devices"),
            drivers_dir: KobjDir::new("drivers"),
            desc,
            drivers_autoprobe: AtomicBool::new(autoprobe),
            drivers: LockedVec::new(),
            devices: LockedVec::new(),
            dev_root: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    pub fn path(&self) -> Option<Box<str>> {
        self.dir.kobj().path()
    }

    pub(crate) fn dev_name(&self) -> Option<&'static str> {
        self.desc.dev_name
    }

    pub(crate) fn uevent_hook(&self) -> Option<UeventFn> {
        self.desc.uevent
    }

    pub(crate) fn probe_hook(&self) -> Option<ProbeFn> {
        self.desc.probe
    }

    pub(crate) fn remove_hook(&self) -> Option<RemoveFn> {
        self.desc.remove
    }

    pub fn drivers_autoprobe(&self) -> bool {
        self.drivers_autoprobe.load(Ordering::Acquire)
    }

    pub fn set_drivers_autoprobe(&self, enabled: bool) {
        self.drivers_autoprobe.store(enabled, Ordering::Release);
    }

    /// Default parent for parentless devices on this bus.
    pub fn set_dev_root(&self, root: &Handle<Device>) {
        *self.dev_root.write() = Some(root.create_ref());
    }

    pub fn dev_root(&self) -> Option<Handle<Device>> {
        self.dev_root.read().as_ref().and_then(HandleRef::get_handle)
    }

    /// Registered drivers, in registration order.
    pub fn drivers(&self) -> Vec<Arc<DeviceDriver>> {
        self.drivers.snapshot()
    }

    pub fn devices(&self) -> Vec<Handle<Device>> {
        self.devices.snapshot()
    }

    pub fn find_driver(&self, name: &str) -> Option<Arc<DeviceDriver>> {
        self.drivers.find(|drv| drv.name() == name)
    }

    /// The bus match hook, else the driver's own predicate.
    pub fn matches(&self, dev: &Device, drv: &DeviceDriver) -> bool {
        match self.desc.match_fn {
            Some(match_fn) => match_fn(dev, drv),
            None => drv.ops().matches(dev),
        }
    }
}

impl DeviceCore {
    pub fn bus_register(&self, desc: BusType) -> Result<Arc<Bus>, DevError> {
        let bus = Arc::new(Bus::new(desc, self.config().drivers_autoprobe));
        let mut log = PublishLog::default();
        let steps = [
            (bus.dir.node(), self.bus_root.node()),
            (bus.devices_dir.node(), bus.dir.node()),
            (bus.drivers_dir.node(), bus.dir.node()),
        ];
        for (node, parent) in steps {
            if let Err(err) = self.namespace.publish(&node, Some(&parent)) {
                log.unwind(&self.namespace, &self.collab);
                return Err(err.into());
            }
            log.node(Arc::downgrade(&node));
        }
        self.buses.push(bus.clone());
        info!("bus: '{}': registered", bus.name());
        Ok(bus)
    }

    /// Unregister every driver of `bus` and take it out of the hierarchy.
    pub fn bus_unregister(&self, bus: &Arc<Bus>) {
        for drv in bus.drivers.snapshot().into_iter().rev() {
            self.driver_unregister(&drv);
        }
        self.namespace.unpublish(&bus.drivers_dir.node());
        self.namespace.unpublish(&bus.devices_dir.node());
        self.namespace.unpublish(&bus.dir.node());
        self.buses.remove_first(|b| Arc::ptr_eq(b, bus));
        info!("bus: '{}': unregistered", bus.name());
    }

    /// Publish the bus side of a new device: bus attributes, the `subsystem` link and the
    /// `devices/<name>` entry of the bus.
    pub(crate) fn bus_add_device(
        &self,
        dev: &Device,
        path: &str,
        log: &mut PublishLog,
    ) -> Result<(), DevError> {
        let Some(bus) = dev.bus() else {
            return Ok(());
        };
        info!("bus: '{}': add device {}", bus.name(), dev.name());
        sysfs::create_files(&self.collab, log, path, &bus.desc.dev_attrs)?;

        let bus_path = bus.path().ok_or(DevError::NoDevice)?;
        let devices_path = bus.devices_dir.kobj().path().ok_or(DevError::NoDevice)?;
        let name = dev.name();
        self.collab.links.create_link(&devices_path, path, &name)?;
        log.link(&devices_path, &name);
        // A class device already carries a `subsystem` link to its class.
        if dev.class().is_none() {
            self.collab.links.create_link(path, &bus_path, "subsystem")?;
            log.link(path, "subsystem");
        }
        Ok(())
    }

    /// Attach a freshly added device if the bus probes automatically.
    pub fn bus_probe_device(&self, dev: &Handle<Device>) {
        let Some(bus) = dev.bus() else {
            return;
        };
        if bus.drivers_autoprobe() {
            if let Err(err) = self.device_attach(dev) {
                info!("bus: '{}': attaching {} failed: {}", bus.name(), dev.name(), err);
            }
        }
    }

    pub(crate) fn bus_remove_device(&self, dev: &Handle<Device>) {
        let Some(bus) = dev.bus() else {
            return;
        };
        self.device_release_driver(dev);
        bus.devices.remove_first(|d| Handle::ptr_eq(d, dev));
        info!("bus: '{}': remove device {}", bus.name(), dev.name());
    }
}
