//! The device core: hierarchy roots, registries and the device add/remove sequences.
//!
//! Initialization order: the configured roots (`devices`, `devices/virtual`, `bus`, `class` and
//! the char-device directory) are published when the core is built; buses and classes are
//! registered next, then devices and drivers in any order; [DeviceCore::deferred_probe_initcall]
//! runs once the initial population is in place.
//!
//! `device_add` publishes in a fixed order and records every step. If any step fails the
//! recorded steps are undone most recent first and the device is left exactly as it was before
//! the call, ready to be added again.
use core::{
    fmt::{self, Debug},
    sync::atomic::Ordering,
};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use utils::vec::LockedVec;

use crate::{
    config::CoreConfig,
    dev::{
        Device,
        bus::Bus,
        class::{Class, GlueDir},
        deferred::DeferredProbe,
        dev::{dev_attr, uevent_attr},
    },
    error::{DevError, KobjError},
    kobj::{Handle, Kobj, KobjDir, KobjPtr, KobjState, Namespace},
    sysfs::{self, BusEvent, Collaborators, Event, KobjAction, PublishLog, UeventEnv},
};

/// Node a device is published under.
#[derive(Debug, Clone)]
pub(crate) enum ParentNode {
    Root(Handle<KobjDir>),
    Device(Handle<Device>),
    Glue(Handle<GlueDir>),
}

impl ParentNode {
    pub fn node(&self) -> KobjPtr {
        match self {
            Self::Root(dir) => dir.node(),
            Self::Device(dev) => dev.node(),
            Self::Glue(glue) => glue.node(),
        }
    }
}

pub struct DeviceCore {
    pub(crate) me: Weak<DeviceCore>,
    config: CoreConfig,
    pub(crate) collab: Collaborators,
    pub(crate) namespace: Namespace,
    devices_root: Handle<KobjDir>,
    virtual_dir: Handle<KobjDir>,
    pub(crate) bus_root: Handle<KobjDir>,
    pub(crate) class_root: Handle<KobjDir>,
    /// Chain of directories down to the char-device directory.
    char_dirs: Vec<Handle<KobjDir>>,
    pub(crate) devices: LockedVec<Handle<Device>>,
    pub(crate) buses: LockedVec<Arc<Bus>>,
    pub(crate) classes: LockedVec<Arc<Class>>,
    pub(crate) deferred: DeferredProbe,
}

impl Debug for DeviceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCore")
            .field("devices", &self.devices.len())
            .field("buses", &self.buses)
            .field("classes", &self.classes)
            .finish_non_exhaustive()
    }
}

impl DeviceCore {
    pub fn new(config: CoreConfig, collab: Collaborators) -> Result<Arc<DeviceCore>, DevError> {
        config.validate()?;
        let namespace = Namespace::new();
        let devices_root = KobjDir::new(&config.devices_root);
        let virtual_dir = KobjDir::new(&config.virtual_dir);
        let bus_root = KobjDir::new(&config.bus_root);
        let class_root = KobjDir::new(&config.class_root);
        namespace.publish(&devices_root.node(), None)?;
        namespace.publish(&virtual_dir.node(), Some(&devices_root.node()))?;
        namespace.publish(&bus_root.node(), None)?;
        namespace.publish(&class_root.node(), None)?;

        let mut char_dirs: Vec<Handle<KobjDir>> = Vec::new();
        for segment in config.char_dev_segments() {
            let dir = KobjDir::new(segment);
            let parent = char_dirs.last().map(|parent| parent.node());
            namespace.publish(&dir.node(), parent.as_ref())?;
            char_dirs.push(dir);
        }

        info!("device core initialized");
        Ok(Arc::new_cyclic(|me| DeviceCore {
            me: me.clone(),
            config,
            collab,
            namespace,
            devices_root,
            virtual_dir,
            bus_root,
            class_root,
            char_dirs,
            devices: LockedVec::new(),
            buses: LockedVec::new(),
            classes: LockedVec::new(),
            deferred: DeferredProbe::new(),
        }))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn devices_root(&self) -> &Handle<KobjDir> {
        &self.devices_root
    }

    /// Registered devices, in registration order.
    pub fn devices(&self) -> Vec<Handle<Device>> {
        self.devices.snapshot()
    }

    pub fn find_device(&self, path: &str) -> Option<Handle<Device>> {
        self.devices.find(|dev| dev.path().as_deref() == Some(path))
    }

    pub fn buses(&self) -> Vec<Arc<Bus>> {
        self.buses.snapshot()
    }

    pub fn classes(&self) -> Vec<Arc<Class>> {
        self.classes.snapshot()
    }

    fn char_dir_path(&self) -> Option<Box<str>> {
        self.char_dirs.last().and_then(|dir| dir.kobj().path())
    }

    /// Pick the node `dev` is published under, creating its glue directory if needed.
    fn device_parent_node(&self, dev: &Device) -> Result<ParentNode, DevError> {
        let parent = match dev.parent_ref() {
            Some(parent) => {
                let parent = parent.get_handle().ok_or(KobjError::InvalidParent)?;
                if !parent.is_registered() {
                    return Err(KobjError::InvalidParent.into());
                }
                Some(parent)
            }
            None => None,
        };

        if let Some(class) = dev.class() {
            let node = match &parent {
                None => self.virtual_dir.node(),
                // Class devices below a class device nest directly.
                Some(parent) if parent.class().is_some() && !class.ns_type() => {
                    return Ok(ParentNode::Device(parent.clone()));
                }
                Some(parent) => parent.node(),
            };
            return self.get_glue_dir(class, &node).map(ParentNode::Glue);
        }

        if let Some(parent) = parent {
            return Ok(ParentNode::Device(parent));
        }
        if let Some(root) = dev.bus().and_then(|bus| bus.dev_root()) {
            return Ok(ParentNode::Device(root));
        }
        Ok(ParentNode::Root(self.devices_root.clone()))
    }

    /// Assign the final name: the provisional one, else `<bus dev_name><id>`.
    fn device_set_name(&self, dev: &Device) -> Result<(), DevError> {
        if let Some(init_name) = dev.init_name() {
            dev.kobj().set_name(init_name)?;
        } else if dev.kobj().name().is_none() {
            let enumerated = dev
                .bus()
                .and_then(|bus| bus.dev_name())
                .zip(dev.id())
                .map(|(prefix, id)| format!("{}{}", prefix, id));
            if let Some(name) = enumerated {
                dev.kobj().set_name(&name)?;
            }
        }
        if dev.kobj().name().is_none() {
            return Err(KobjError::InvalidName.into());
        }
        Ok(())
    }

    fn device_add_class_symlinks(
        &self,
        dev: &Device,
        path: &str,
        log: &mut PublishLog,
    ) -> Result<(), DevError> {
        let Some(class) = dev.class() else {
            return Ok(());
        };
        let class_path = class.path().ok_or(KobjError::NotPublished)?;
        self.collab.links.create_link(path, &class_path, "subsystem")?;
        log.link(path, "subsystem");

        if let Some(parent_path) = dev.parent().and_then(|parent| parent.path()) {
            self.collab.links.create_link(path, &parent_path, "device")?;
            log.link(path, "device");
        }

        let name = dev.name();
        self.collab.links.create_link(&class_path, path, &name)?;
        log.link(&class_path, &name);
        Ok(())
    }

    /// Class attributes, then type groups, then the device's own groups.
    fn device_add_attrs(
        &self,
        dev: &Device,
        path: &str,
        log: &mut PublishLog,
    ) -> Result<(), DevError> {
        if let Some(class) = dev.class() {
            sysfs::create_files(&self.collab, log, path, class.dev_attrs())?;
        }
        if let Some(dev_type) = dev.dev_type() {
            sysfs::create_groups(&self.collab, log, path, dev, &dev_type.groups)?;
        }
        sysfs::create_groups(&self.collab, log, path, dev, dev.groups())?;
        Ok(())
    }

    /// Every externally visible step of `device_add`, recorded in `log`.
    fn device_publish(
        &self,
        dev: &Handle<Device>,
        parent: &ParentNode,
        log: &mut PublishLog,
    ) -> Result<(), DevError> {
        let node = dev.node();
        self.namespace.publish(&node, Some(&parent.node()))?;
        log.node(Arc::downgrade(&node));
        let path = dev.path().ok_or(KobjError::NotPublished)?;

        sysfs::create_files(&self.collab, log, &path, &[uevent_attr()])?;
        if dev.devt().major() != 0 {
            sysfs::create_files(&self.collab, log, &path, &[dev_attr()])?;
            let char_path = self.char_dir_path().ok_or(KobjError::NotPublished)?;
            let link = dev.devt().to_string();
            self.collab.links.create_link(&char_path, &path, &link)?;
            log.link(&char_path, &link);
        }
        self.device_add_class_symlinks(dev, &path, log)?;
        self.device_add_attrs(dev, &path, log)?;
        self.bus_add_device(dev, &path, log)?;
        Ok(())
    }

    /// Add `dev` to the hierarchy, publish it and try to bind a driver.
    ///
    /// Name and parent are checked before anything is published. On a publishing failure every
    /// step already taken is undone, most recent first.
    pub fn device_add(&self, dev: &Handle<Device>) -> Result<(), DevError> {
        if dev.is_registered() {
            return Err(KobjError::AlreadyPublished.into());
        }
        self.device_set_name(dev)?;
        debug!("device: '{}': device_add", dev.name());

        let parent = self.device_parent_node(dev)?;
        let mut log = PublishLog::default();
        if let Err(err) = self.device_publish(dev, &parent, &mut log) {
            warn!("device: '{}': device_add failed: {}", dev.name(), err);
            log.unwind(&self.namespace, &self.collab);
            if let ParentNode::Glue(glue) = parent {
                self.cleanup_glue_dir(glue);
            }
            return Err(err);
        }

        *dev.p.published.lock() = log;
        if let ParentNode::Glue(glue) = parent {
            *dev.p.glue.lock() = Some(glue);
        }
        *dev.p.core.write() = self.me.clone();
        dev.p.dead.store(false, Ordering::Release);
        self.devices.push(dev.clone());
        if let Some(bus) = dev.bus() {
            bus.devices.push(dev.clone());
        }
        if let Some(parent) = dev.parent() {
            parent.p.children.push(dev.clone());
        }
        if let Some(class) = dev.class() {
            class.devices.push(dev.clone());
        }

        self.bus_notify(dev, BusEvent::AddDevice);
        self.kobject_uevent(dev, KobjAction::Add);
        self.bus_probe_device(dev);
        Ok(())
    }

    /// Same as [DeviceCore::device_add]; the builder already did the initialization half.
    pub fn device_register(&self, dev: &Handle<Device>) -> Result<(), DevError> {
        self.device_add(dev)
    }

    /// Take `dev` out of the hierarchy. The device can be added again afterwards.
    pub fn device_del(&self, dev: &Handle<Device>) -> Result<(), DevError> {
        if !dev.is_registered() {
            return Err(DevError::NoDevice);
        }
        debug!("device: '{}': device_del", dev.name());
        {
            // Waits out a running probe; nothing binds or defers the device after this.
            let _guard = dev.lock_device();
            dev.p.dead.store(true, Ordering::Release);
            self.driver_deferred_probe_del(dev);
        }
        if let Some(parent) = dev.parent() {
            parent.p.children.remove_first(|d| Handle::ptr_eq(d, dev));
        }
        if let Some(class) = dev.class() {
            class.devices.remove_first(|d| Handle::ptr_eq(d, dev));
        }
        self.bus_notify(dev, BusEvent::DelDevice);
        self.bus_remove_device(dev);
        self.devices.remove_first(|d| Handle::ptr_eq(d, dev));
        self.kobject_uevent(dev, KobjAction::Remove);

        let mut log = core::mem::take(&mut *dev.p.published.lock());
        log.unwind(&self.namespace, &self.collab);
        if let Some(glue) = dev.p.glue.lock().take() {
            self.cleanup_glue_dir(glue);
        }
        *dev.p.core.write() = Weak::new();
        Ok(())
    }

    /// Delete `dev` and drop the caller's reference to it.
    pub fn device_unregister(&self, dev: Handle<Device>) -> Result<(), DevError> {
        let result = self.device_del(&dev);
        dev.release();
        result
    }

    /// Broadcast a uevent for `dev` unless the device is filtered out.
    pub fn kobject_uevent(&self, dev: &Device, action: KobjAction) {
        let Some(subsystem) = dev.uevent_subsystem().filter(|_| dev.uevent_filter()) else {
            debug!("device: '{}': uevent {} filtered", dev.name(), action.as_str());
            return;
        };
        let Some(path) = dev.path() else {
            return;
        };
        match action {
            KobjAction::Add => dev.kobj().mark(KobjState::ADD_EVENT_SENT),
            KobjAction::Remove => dev.kobj().mark(KobjState::REMOVE_EVENT_SENT),
            _ => {}
        }
        let mut env = UeventEnv::default();
        env.add("ACTION", action.as_str());
        env.add("DEVPATH", &path);
        env.add("SUBSYSTEM", subsystem);
        env.extend(dev.uevent_env());
        let event = Event::Uevent { action, env };
        if let Err(err) = self.collab.notifier.broadcast(&event, dev) {
            debug!("device: '{}': uevent broadcast failed: {}", dev.name(), err);
        }
    }
}

impl Drop for DeviceCore {
    fn drop(&mut self) {
        self.deferred.shutdown();
    }
}
