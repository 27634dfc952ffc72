//! Attach/bind state machine.
//!
//! A device goes from unbound to bound through a successful probe (or a direct bind when the
//! device names its driver), or parks on the deferred-probe lists when the probe reports a
//! missing dependency. Probe failures never propagate past the attach loop: the next driver
//! gets its chance and the device ends up unbound or deferred.
//!
//! All attach and release paths take the device lock, so probe and remove of one device never
//! overlap. `device_del` marks the device dead under the same lock; a dead device is neither
//! bound nor queued for deferred probing.
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::{
    dev::{
        Device, DeviceCore,
        driver::{BindState, DeviceDriver, DriverProbeError},
    },
    error::{DevError, KobjError},
    kobj::Handle,
    sysfs::{BusEvent, Event},
};

impl DeviceCore {
    /// Tell the bus notifier about `dev`. Only bus devices have listeners.
    pub(crate) fn bus_notify(&self, dev: &Device, event: BusEvent) {
        if dev.bus().is_none() {
            return;
        }
        if let Err(err) = self.collab.notifier.broadcast(&Event::Bus(event), dev) {
            debug!("device: '{}': notifier {:?} failed: {}", dev.name(), event, err);
        }
    }

    /// Publish `drivers/<drv>/<dev>` and `<dev>/driver`.
    fn driver_sysfs_add(&self, dev: &Handle<Device>, drv: &DeviceDriver) -> Result<(), DevError> {
        self.bus_notify(dev, BusEvent::BindDriver);
        let dev_path = dev.path().ok_or(DevError::NoDevice)?;
        let drv_path = drv.path().ok_or(KobjError::NotPublished)?;
        let name = dev.name();
        self.collab.links.create_link(&drv_path, &dev_path, &name)?;
        if let Err(err) = self.collab.links.create_link(&dev_path, &drv_path, "driver") {
            self.collab.links.remove_link(&drv_path, &name);
            return Err(err.into());
        }
        Ok(())
    }

    fn driver_sysfs_remove(&self, dev: &Device, drv: &DeviceDriver) {
        if let (Some(dev_path), Some(drv_path)) = (dev.path(), drv.path()) {
            self.collab.links.remove_link(&drv_path, &dev.name());
            self.collab.links.remove_link(&dev_path, "driver");
        }
    }

    /// Record `dev` on the driver's device list and wake up deferred devices.
    fn driver_bound(&self, dev: &Handle<Device>, drv: &Arc<DeviceDriver>) {
        if !drv.devices.push_unique(dev.clone(), Handle::ptr_eq) {
            warn!(
                "driver_bound: device {} already bound to {}",
                dev.name(),
                drv.name()
            );
            return;
        }
        debug!(
            "driver: '{}': driver_bound: bound to device '{}'",
            drv.name(),
            dev.name()
        );
        // A device that binds is no longer waiting, and its arrival may satisfy others.
        self.driver_deferred_probe_del(dev);
        self.driver_deferred_probe_trigger();
        self.bus_notify(dev, BusEvent::BoundDriver);
    }

    /// Bind with the device lock held and no probe.
    fn bind_locked(&self, dev: &Handle<Device>, drv: &Arc<DeviceDriver>) -> Result<(), DevError> {
        if !dev.is_bindable() {
            return Err(DevError::NoDevice);
        }
        if let Some(current) = dev.driver() {
            if !Arc::ptr_eq(&current, drv) {
                return Err(DevError::Busy);
            }
            if drv.is_bound(dev) {
                self.driver_bound(dev, drv);
                return Ok(());
            }
        }
        *dev.driver.write() = Some(drv.clone());
        if let Err(err) = self.driver_sysfs_add(dev, drv) {
            *dev.driver.write() = None;
            return Err(err);
        }
        self.driver_bound(dev, drv);
        Ok(())
    }

    /// Bind `drv` to `dev` without probing. Binding the same pair again is a logged no-op.
    pub fn device_bind_driver(
        &self,
        dev: &Handle<Device>,
        drv: &Arc<DeviceDriver>,
    ) -> Result<(), DevError> {
        let _guard = dev.lock_device();
        self.bind_locked(dev, drv)
    }

    fn really_probe(&self, dev: &Handle<Device>, drv: &Arc<DeviceDriver>) -> Result<(), DevError> {
        debug!(
            "bus: '{}': really_probe: probing driver {} with device {}",
            drv.bus().map_or("", |bus| bus.name()),
            drv.name(),
            dev.name()
        );
        *dev.driver.write() = Some(drv.clone());
        if let Err(err) = self.driver_sysfs_add(dev, drv) {
            error!("really_probe: driver_sysfs_add({}) failed: {}", dev.name(), err);
            *dev.driver.write() = None;
            return Err(err);
        }

        let bus_probe = drv.bus().and_then(|bus| bus.probe_hook());
        let ret = match bus_probe {
            Some(probe) => probe(dev),
            None => drv.ops().probe(dev),
        };
        let Err(err) = ret else {
            self.driver_bound(dev, drv);
            debug!(
                "bus: '{}': really_probe: bound device {} to driver {}",
                drv.bus().map_or("", |bus| bus.name()),
                dev.name(),
                drv.name()
            );
            return Ok(());
        };

        self.driver_sysfs_remove(dev, drv);
        if let Err(devres) = dev.devres_release_all() {
            error!("{}: releasing resources after failed probe: {}", dev.name(), devres);
        }
        *dev.driver.write() = None;
        match err {
            DriverProbeError::Deferred if dev.is_bindable() => {
                debug!("Driver {} requests probe deferral", drv.name());
                self.driver_deferred_probe_add(dev);
            }
            DriverProbeError::Deferred => {
                debug!("{}: deferred while going away, not queued", dev.name());
            }
            DriverProbeError::NoDevice => {
                trace!("{}: probe of {} rejected the device", drv.name(), dev.name());
            }
            other => warn!(
                "{}: probe of {} failed with error {}",
                drv.name(),
                dev.name(),
                other
            ),
        }
        Err(err.into())
    }

    fn driver_probe_device(
        &self,
        dev: &Handle<Device>,
        drv: &Arc<DeviceDriver>,
    ) -> Result<(), DevError> {
        if !dev.is_bindable() {
            return Err(DevError::NoDevice);
        }
        self.really_probe(dev, drv)
    }

    /// Try to find a driver for `dev`.
    ///
    /// A device that names its driver is bound to it directly; otherwise every driver of the bus
    /// is tried in registration order until one probes successfully.
    pub fn device_attach(&self, dev: &Handle<Device>) -> Result<BindState, DevError> {
        let _guard = dev.lock_device();
        if !dev.is_bindable() {
            return Err(DevError::NoDevice);
        }
        if let Some(drv) = dev.driver() {
            if drv.is_bound(dev) {
                return Ok(BindState::Bound);
            }
            return match self.bind_locked(dev, &drv) {
                Ok(()) => Ok(BindState::Bound),
                Err(err) => {
                    debug!("{}: binding to {} failed: {}", dev.name(), drv.name(), err);
                    *dev.driver.write() = None;
                    Ok(BindState::Unbound)
                }
            };
        }

        if let Some(bus) = dev.bus() {
            for drv in bus.drivers.snapshot() {
                if !bus.matches(dev, &drv) {
                    continue;
                }
                if self.driver_probe_device(dev, &drv).is_ok() {
                    return Ok(BindState::Bound);
                }
            }
        }
        Ok(self.bind_state(dev))
    }

    /// Try `drv` on every unbound device of its bus.
    pub fn driver_attach(&self, drv: &Arc<DeviceDriver>) {
        let Some(bus) = drv.bus() else {
            return;
        };
        for dev in bus.devices.snapshot() {
            if !bus.matches(&dev, drv) {
                continue;
            }
            let _guard = dev.lock_device();
            if dev.driver().is_none() {
                let _ = self.driver_probe_device(&dev, drv);
            }
        }
    }

    pub(crate) fn release_driver_locked(&self, dev: &Handle<Device>) {
        let Some(drv) = dev.driver() else {
            return;
        };
        if !drv.is_bound(dev) {
            return;
        }
        self.bus_notify(dev, BusEvent::UnbindDriver);
        self.driver_sysfs_remove(dev, &drv);
        match drv.bus().and_then(|bus| bus.remove_hook()) {
            Some(remove) => remove(dev),
            None => drv.ops().remove(dev),
        }
        if let Err(err) = dev.devres_release_all() {
            error!("{}: releasing resources on unbind: {}", dev.name(), err);
        }
        *dev.driver.write() = None;
        drv.devices.remove_first(|d| Handle::ptr_eq(d, dev));
        self.bus_notify(dev, BusEvent::UnboundDriver);
        debug!("driver: '{}': unbound device '{}'", drv.name(), dev.name());
    }

    /// Unbind `dev` from its driver, if it has one.
    pub fn device_release_driver(&self, dev: &Handle<Device>) {
        let _guard = dev.lock_device();
        self.release_driver_locked(dev);
    }

    /// Unbind every device bound to `drv`.
    pub fn driver_detach(&self, drv: &Arc<DeviceDriver>) {
        for dev in drv.devices.snapshot() {
            let _guard = dev.lock_device();
            if dev.driver().is_some_and(|d| Arc::ptr_eq(&d, drv)) {
                self.release_driver_locked(&dev);
            }
        }
    }

    pub fn bind_state(&self, dev: &Handle<Device>) -> BindState {
        if dev.driver().is_some_and(|drv| drv.is_bound(dev)) {
            BindState::Bound
        } else if self.deferred.contains(dev) {
            BindState::Deferred
        } else {
            BindState::Unbound
        }
    }
}
