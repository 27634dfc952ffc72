//! Drivers: the [Driver] trait implemented by driver code and the [DeviceDriver] record the core
//! keeps for each registered driver.
//!
//! Responsibilities:
//! - [Driver::matches] and [Driver::probe] decide whether a driver takes a device. A bus match
//!   hook overrides `matches`, a bus probe hook overrides `probe`.
//! - [DeviceDriver] keeps the list of devices currently bound to the driver. A device appears in
//!   that list at most once.
//!
//! Registration lives in [DeviceCore::driver_register]; probing and binding in the binder.
use core::fmt::{self, Debug, Display};
use std::sync::{Arc, Weak};

use log::{error, info};
use utils::vec::LockedVec;

use crate::{
    dev::{Device, DeviceCore, bus::Bus},
    error::{DevError, KobjError},
    kobj::{Handle, Kobj, KobjDir},
};

/// Trait implemented by drivers.
///
/// Guarantees and expectations:
/// - Implementations must be `Send + Sync`; probes run on caller threads and on the
///   deferred-probe worker, never concurrently for the same device.
/// - [Driver::probe] returns [DriverProbeError::Deferred] when a dependency is not ready yet;
///   the device is retried after the next successful bind anywhere in the system.
pub trait Driver: Send + Sync + Debug {
    fn get_name(&self) -> &'static str;

    fn matches(&self, _dev: &Device) -> bool {
        true
    }

    fn probe(&self, dev: &Handle<Device>) -> Result<(), DriverProbeError>;

    fn remove(&self, _dev: &Handle<Device>) {}
}

/// A driver as known to the core.
pub struct DeviceDriver {
    ops: Box<dyn Driver>,
    bus: Weak<Bus>,
    pub(crate) devices: LockedVec<Handle<Device>>,
    pub(crate) dir: Handle<KobjDir>,
}

impl Debug for DeviceDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDriver")
            .field("ops", &self.ops)
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl DeviceDriver {
    pub fn new(bus: &Arc<Bus>, ops: impl Driver + 'static) -> Arc<DeviceDriver> {
        Arc::new(DeviceDriver {
            dir: KobjDir::new(ops.get_name()),
            ops: Box::new(ops),
            bus: Arc::downgrade(bus),
            devices: LockedVec::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.ops.get_name()
    }

    pub fn ops(&self) -> &dyn Driver {
        &*self.ops
    }

    pub fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.upgrade()
    }

    pub fn path(&self) -> Option<Box<str>> {
        self.dir.kobj().path()
    }

    pub fn is_registered(&self) -> bool {
        self.dir.kobj().is_published()
    }

    /// Devices currently bound to this driver.
    pub fn devices(&self) -> Vec<Handle<Device>> {
        self.devices.snapshot()
    }

    pub fn is_bound(&self, dev: &Handle<Device>) -> bool {
        self.devices.any(|d| Handle::ptr_eq(d, dev))
    }
}

/// Where a device stands with respect to drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Bound,
    /// Waiting on the deferred-probe lists.
    Deferred,
}

impl DeviceCore {
    /// Register `drv` on its bus and, with autoprobe on, try it on every unbound device there.
    pub fn driver_register(&self, drv: &Arc<DeviceDriver>) -> Result<(), DevError> {
        let bus = drv.bus().ok_or(KobjError::InvalidParent)?;
        if bus.find_driver(drv.name()).is_some() {
            error!("Error: Driver '{}' is already registered, aborting...", drv.name());
            let path = format!("{}/{}", bus.path().unwrap_or_default(), drv.name());
            return Err(KobjError::Exists { path: path.into() }.into());
        }
        self.namespace
            .publish(&drv.dir.node(), Some(&bus.drivers_dir.node()))?;
        bus.drivers.push(drv.clone());
        info!("bus: '{}': add driver {}", bus.name(), drv.name());
        if bus.drivers_autoprobe() {
            self.driver_attach(drv);
        }
        Ok(())
    }

    /// Detach every device bound to `drv` and take it off its bus.
    pub fn driver_unregister(&self, drv: &Arc<DeviceDriver>) {
        if let Some(bus) = drv.bus() {
            bus.drivers.remove_first(|d| Arc::ptr_eq(d, drv));
            info!("bus: '{}': remove driver {}", bus.name(), drv.name());
        }
        self.driver_detach(drv);
        self.namespace.unpublish(&drv.dir.node());
    }
}

// region: Error Types

/// Errors that may be returned by [Driver::probe].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverProbeError {
    /// A dependency is not available yet; retry later.
    Deferred,
    /// The driver does not handle this device after all.
    NoDevice,
    /// Out of memory, usually a failed devres allocation.
    NoMemory,
    /// A sub-device failed to initialize; propagate up.
    SubDeviceError,
    /// Custom driver-specific information.
    Customized { info: &'static str },
}

impl Display for DriverProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deferred => f.write_str("probe deferred"),
            Self::NoDevice => f.write_str("no such device"),
            Self::NoMemory => f.write_str("out of memory"),
            Self::SubDeviceError => f.write_str("sub-device failed"),
            Self::Customized { info } => f.write_str(info),
        }
    }
}

impl std::error::Error for DriverProbeError {}

impl From<crate::error::DevresError> for DriverProbeError {
    fn from(value: crate::error::DevresError) -> Self {
        match value {
            crate::error::DevresError::OutOfMemory => Self::NoMemory,
            _ => Self::Customized {
                info: "managed resource failure",
            },
        }
    }
}

// endregion
