//! Driver core: a reference-counted device hierarchy, driver binding with deferred probing and
//! device-managed resources.
//!
//! Everything hangs off a [DeviceCore], built from a [CoreConfig] and the presentation
//! [Collaborators](sysfs::Collaborators) it publishes through.

pub mod config;
pub mod dev;
pub mod error;
pub mod kobj;
pub mod logging;
pub mod sysfs;

pub use config::CoreConfig;
pub use dev::{
    BindState, Bus, BusType, Class, ClassType, DevT, Device, DeviceBuilder, DeviceCore,
    DeviceDriver, DeviceType, Driver, DriverProbeError,
};
pub use error::{DevError, DevresError, KobjError, PublishError};
pub use kobj::{Handle, HandleRef};
