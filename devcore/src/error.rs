//! Error types shared by the driver core.
//!
//! Each concern owns a small enum; [DevError] wraps all of them so registration paths can thread
//! failures through `?`. Devres corruption is reported as [DevresError::Corrupted] and is the only
//! variant that poisons state: the affected device refuses further resource operations.

use core::fmt::{self, Display};

use crate::{config::ConfigError, dev::driver::DriverProbeError};

/// Failures of the object registry and its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KobjError {
    /// Name missing, empty, or containing a path separator.
    InvalidName,
    /// The node is already part of the hierarchy.
    AlreadyPublished,
    /// The node has not been published yet.
    NotPublished,
    /// Another live node already occupies this path.
    Exists { path: Box<str> },
    /// The parent is gone or was never published.
    InvalidParent,
}

/// Failures reported by an external publishing collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    Exists { path: Box<str> },
    NotFound { path: Box<str> },
    Failed { reason: &'static str },
}

/// Failures of the device-managed resource allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevresError {
    /// The resource arena could not grow.
    OutOfMemory,
    /// The handle does not name a live entry (or the payload type does not match).
    NotFound,
    GroupNotFound,
    GroupClosed,
    /// `end` does not follow `first` in the resource list.
    InvalidRange,
    /// The resource list failed a structural check; the device's list is poisoned.
    Corrupted,
}

/// Failures of attribute show/store dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrError {
    /// No callback for the requested direction.
    Io,
    Invalid,
}

#[derive(Debug)]
pub enum DevError {
    Kobj(KobjError),
    Publish(PublishError),
    Devres(DevresError),
    Probe(DriverProbeError),
    Config(ConfigError),
    /// The device is bound to a different driver.
    Busy,
    /// The device is not registered.
    NoDevice,
    /// The deferred-probe worker could not be started.
    Worker(std::io::Error),
}

impl Display for KobjError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName => f.write_str("invalid object name"),
            Self::AlreadyPublished => f.write_str("object already published"),
            Self::NotPublished => f.write_str("object not published"),
            Self::Exists { path } => write!(f, "'{}' already exists", path),
            Self::InvalidParent => f.write_str("invalid parent"),
        }
    }
}

impl Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exists { path } => write!(f, "'{}' already published", path),
            Self::NotFound { path } => write!(f, "'{}' not found", path),
            Self::Failed { reason } => write!(f, "publishing failed: {}", reason),
        }
    }
}

impl Display for DevresError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::NotFound => "no such managed resource",
            Self::GroupNotFound => "no such resource group",
            Self::GroupClosed => "resource group already closed",
            Self::InvalidRange => "invalid resource range",
            Self::Corrupted => "resource list corrupted",
        };
        f.write_str(msg)
    }
}

impl Display for AttrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io => f.write_str("I/O error"),
            Self::Invalid => f.write_str("invalid argument"),
        }
    }
}

impl Display for DevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kobj(err) => err.fmt(f),
            Self::Publish(err) => err.fmt(f),
            Self::Devres(err) => err.fmt(f),
            Self::Probe(err) => err.fmt(f),
            Self::Config(err) => err.fmt(f),
            Self::Busy => f.write_str("device is bound to another driver"),
            Self::NoDevice => f.write_str("no such device"),
            Self::Worker(err) => write!(f, "deferred probe worker: {}", err),
        }
    }
}

impl std::error::Error for KobjError {}
impl std::error::Error for PublishError {}
impl std::error::Error for DevresError {}
impl std::error::Error for AttrError {}

impl std::error::Error for DevError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Kobj(err) => Some(err),
            Self::Publish(err) => Some(err),
            Self::Devres(err) => Some(err),
            Self::Probe(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::Worker(err) => Some(err),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($from: ty, $variant: ident) => {
        impl From<$from> for DevError {
            fn from(value: $from) -> Self {
                DevError::$variant(value)
            }
        }
    };
}

impl_from!(KobjError, Kobj);
impl_from!(PublishError, Publish);
impl_from!(DevresError, Devres);
impl_from!(DriverProbeError, Probe);
impl_from!(ConfigError, Config);
