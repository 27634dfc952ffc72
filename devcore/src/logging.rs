use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError, set_logger, set_max_level};

use crate::{config::CoreConfig, error::DevError};

pub struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 37,  // White
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };
        let mut err = std::io::stderr().lock();
        // A failed diagnostic write has nowhere else to go.
        let _ = writeln!(
            err,
            "\u{1B}[{}m[{:5}] {}: {}\u{1B}[0m",
            color,
            record.level(),
            record.target(),
            record.args(),
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the stderr logger. A second call leaves the first logger in place and reports the error.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    static LOGGER: Logger = Logger;
    set_logger(&LOGGER)?;
    set_max_level(level);
    Ok(())
}

/// Install the stderr logger at the level named by `config.log_level`.
pub fn init_from_config(config: &CoreConfig) -> Result<(), DevError> {
    let level = config.level_filter()?;
    if let Err(err) = init(level) {
        log::warn!("Logger already installed ({}), adjusting level only.", err);
        set_max_level(level);
    }
    Ok(())
}

/// Debug-level log line, only compiled with debug assertions.
#[macro_export]
macro_rules! debug_ex {
    // debug_ex!(target: "my_target", "a {} event", "log")
    (target: $target:expr, $($arg:tt)+) => {
        #[cfg(debug_assertions)]
        {
            ::log::log!(target: $target, ::log::Level::Debug, $($arg)+)
        }
    };

    // debug_ex!("a {} event", "log")
    ($($arg:tt)+) => {
        #[cfg(debug_assertions)]
        {
            ::log::log!(::log::Level::Debug, $($arg)+)
        }
    }
}
