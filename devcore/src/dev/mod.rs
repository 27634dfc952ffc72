//! Device model: devices, buses, classes, drivers, the binder and deferred probing, all owned by
//! a [DeviceCore].

mod bind;
pub mod bus;
pub mod class;
pub mod deferred;
mod dev;
pub mod devres;
pub mod driver;
mod manager;

pub use bus::{Bus, BusType};
pub use class::{Class, ClassType, GlueDir};
pub use deferred::DeferredProbe;
pub use dev::*;
pub use devres::{DevresEntry, DevresHandle, DevresKind, GroupId};
pub use driver::{BindState, DeviceDriver, Driver, DriverProbeError};
pub use manager::DeviceCore;
