//! Runtime configuration of a [DeviceCore](crate::dev::DeviceCore).
//!
//! Configuration is plain JSON; every key is optional and unknown keys are rejected:
//!
//! ```json
//! { "devices_root": "devices", "char_dev_dir": "dev/char", "log_level": "debug" }
//! ```

use core::{fmt, str::FromStr};
use std::{fs, path::Path};

use log::LevelFilter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Root directory of the device hierarchy.
    pub devices_root: String,
    /// Directory under `devices_root` holding class devices without a parent.
    pub virtual_dir: String,
    pub bus_root: String,
    pub class_root: String,
    /// Directory receiving `maj:min` links; may contain `/`.
    pub char_dev_dir: String,
    /// Thread name of the deferred-probe worker.
    pub deferred_worker_name: String,
    /// Initial autoprobe setting of newly registered buses.
    pub drivers_autoprobe: bool,
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            devices_root: String::from("devices"),
            virtual_dir: String::from("virtual"),
            bus_root: String::from("bus"),
            class_root: String::from("class"),
            char_dev_dir: String::from("dev/char"),
            deferred_worker_name: String::from("deferwq"),
            drivers_autoprobe: true,
            log_level: String::from("info"),
        }
    }
}

impl CoreConfig {
    pub fn from_json(text: &str) -> Result<CoreConfig, ConfigError> {
        let config: CoreConfig = serde_json::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<CoreConfig, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json(&text)
    }

    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.log_level).map_err(|_| ConfigError::Invalid {
            field: "log_level",
            reason: "unknown log level",
        })
    }

    /// Segments of [CoreConfig::char_dev_dir].
    pub fn char_dev_segments(&self) -> impl Iterator<Item = &str> {
        self.char_dev_dir.split('/').filter(|s| !s.is_empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let single = [
            ("devices_root", &self.devices_root),
            ("virtual_dir", &self.virtual_dir),
            ("bus_root", &self.bus_root),
            ("class_root", &self.class_root),
        ];
        for (field, value) in single {
            if value.is_empty() || value.contains('/') {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be a single non-empty path segment",
                });
            }
        }
        if self.char_dev_segments().next().is_none() {
            return Err(ConfigError::Invalid {
                field: "char_dev_dir",
                reason: "must name at least one directory",
            });
        }
        if self.deferred_worker_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "deferred_worker_name",
                reason: "must not be empty",
            });
        }
        self.level_filter()?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "reading configuration: {}", err),
            Self::Parse(err) => write!(f, "parsing configuration: {}", err),
            Self::Invalid { field, reason } => write!(f, "configuration '{}': {}", field, reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::Invalid { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = CoreConfig::from_json("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Info);
    }

    #[test]
    fn partial_override() {
        let config =
            CoreConfig::from_json(r#"{ "devices_root": "sys_devices", "log_level": "trace" }"#)
                .unwrap();
        assert_eq!(config.devices_root, "sys_devices");
        assert_eq!(config.virtual_dir, "virtual");
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Trace);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            CoreConfig::from_json(r#"{ "devices": "x" }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            CoreConfig::from_json(r#"{ "bus_root": "a/b" }"#),
            Err(ConfigError::Invalid { field: "bus_root", .. })
        ));
        assert!(matches!(
            CoreConfig::from_json(r#"{ "log_level": "loud" }"#),
            Err(ConfigError::Invalid { field: "log_level", .. })
        ));
        assert!(matches!(
            CoreConfig::from_json(r#"{ "char_dev_dir": "//" }"#),
            Err(ConfigError::Invalid { field: "char_dev_dir", .. })
        ));
    }

    #[test]
    fn nested_char_dir_segments() {
        let config = CoreConfig::default();
        assert_eq!(config.char_dev_segments().collect::<Vec<_>>(), vec!["dev", "char"]);
    }
}
