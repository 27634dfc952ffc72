//! Device classes and the glue directories that keep class devices apart from their parents'
//! own children.
//!
//! A class device whose parent is not itself a class device is published under
//! `<parent>/<class name>`, a glue directory shared by every device of that class below that
//! parent. Parentless class devices use the `virtual` directory as their parent. Glue directories
//! are created on first use under the class lock and removed when the last device using them
//! goes away.
use core::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use log::info;
use spin::Mutex;
use utils::vec::LockedVec;

use crate::{
    dev::{Device, DeviceCore, DevnodeFn, ReleaseFn, UeventFn},
    error::DevError,
    kobj::{Handle, HandleRef, Kobj, KobjDir, KobjPtr, KobjWeak, Kobject, same_node},
    sysfs::Attribute,
};

#[derive(Default)]
pub struct ClassType {
    pub name: &'static str,
    pub dev_attrs: Vec<Attribute>,
    pub dev_uevent: Option<UeventFn>,
    pub devnode: Option<DevnodeFn>,
    /// Release handler for devices that have neither their own nor a type handler.
    pub dev_release: Option<ReleaseFn>,
    /// Namespace-tagged classes always get a glue directory, even below a class device.
    pub ns_type: bool,
}

impl ClassType {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }
}

pub struct Class {
    desc: ClassType,
    pub(crate) dir: Handle<KobjDir>,
    glue_dirs: Mutex<Vec<(KobjWeak, HandleRef<GlueDir>)>>,
    pub(crate) devices: LockedVec<Handle<Device>>,
}

impl Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.desc.name)
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl Class {
    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    pub fn path(&self) -> Option<Box<str>> {
        self.dir.kobj().path()
    }

    pub fn ns_type(&self) -> bool {
        self.desc.ns_type
    }

    pub(crate) fn dev_attrs(&self) -> &[Attribute] {
        &self.desc.dev_attrs
    }

    pub(crate) fn uevent_hook(&self) -> Option<UeventFn> {
        self.desc.dev_uevent
    }

    pub(crate) fn devnode(&self) -> Option<DevnodeFn> {
        self.desc.devnode
    }

    pub(crate) fn dev_release(&self) -> Option<&ReleaseFn> {
        self.desc.dev_release.as_ref()
    }

    pub fn devices(&self) -> Vec<Handle<Device>> {
        self.devices.snapshot()
    }

    pub fn find_device(&self, name: &str) -> Option<Handle<Device>> {
        self.devices.find(|dev| &*dev.name() == name)
    }

    /// Number of live glue directories of this class.
    pub fn glue_dir_count(&self) -> usize {
        self.glue_dirs
            .lock()
            .iter()
            .filter(|(_, glue)| glue.get_handle().is_some())
            .count()
    }
}

/// Intermediate directory `<parent>/<class name>`.
pub struct GlueDir {
    kobj: Kobject,
    class: Weak<Class>,
}

impl Kobj for GlueDir {
    fn kobj(&self) -> &Kobject {
        &self.kobj
    }
}

impl Debug for GlueDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlueDir").field("kobj", &self.kobj).finish()
    }
}

impl GlueDir {
    pub fn path(&self) -> Option<Box<str>> {
        self.kobj.path()
    }
}

impl DeviceCore {
    pub fn class_register(&self, desc: ClassType) -> Result<Arc<Class>, DevError> {
        let class = Arc::new(Class {
            dir: KobjDir::new(desc.name),
            desc,
            glue_dirs: Mutex::new(Vec::new()),
            devices: LockedVec::new(),
        });
        self.namespace
            .publish(&class.dir.node(), Some(&self.class_root.node()))?;
        self.classes.push(class.clone());
        info!("class: '{}': registered", class.name());
        Ok(class)
    }

    pub fn class_unregister(&self, class: &Arc<Class>) {
        self.namespace.unpublish(&class.dir.node());
        self.classes.remove_first(|c| Arc::ptr_eq(c, class));
        info!("class: '{}': unregistered", class.name());
    }

    /// Glue directory of `class` below `parent`, created and published on first use.
    pub(crate) fn get_glue_dir(
        &self,
        class: &Arc<Class>,
        parent: &KobjPtr,
    ) -> Result<Handle<GlueDir>, DevError> {
        let mut dirs = class.glue_dirs.lock();
        let existing = dirs.iter().find_map(|(key, glue)| {
            let key = key.upgrade()?;
            if same_node(&key, parent) {
                glue.get_handle()
            } else {
                None
            }
        });
        if let Some(glue) = existing {
            return Ok(glue);
        }

        dirs.retain(|(_, glue)| glue.get_handle().is_some());
        let glue = Handle::from(GlueDir {
            kobj: Kobject::with_name(class.name()),
            class: Arc::downgrade(class),
        });
        self.namespace.publish(&glue.node(), Some(parent))?;
        dirs.push((Arc::downgrade(parent), glue.create_ref()));
        Ok(glue)
    }

    /// Drop one user of `glue`; the last user takes the directory out of the hierarchy.
    pub(crate) fn cleanup_glue_dir(&self, glue: Handle<GlueDir>) {
        let class = glue.class.upgrade();
        let mut dirs = class.as_ref().map(|class| class.glue_dirs.lock());
        if glue.ref_count() == 1 {
            if let Some(dirs) = dirs.as_mut() {
                dirs.retain(|(_, g)| !g.refers_to(&glue));
            }
            self.namespace.unpublish(&glue.node());
        }
        drop(dirs);
        glue.release();
    }
}
