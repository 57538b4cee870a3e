//! DecoyNet Logging
//!
//! One place to install the `tracing` subscriber for every binary.
//! `RUST_LOG` always wins over the level chosen here.

use std::fmt;

use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter};

/// Verbosity for the `decoynet` crates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// `--verbose` maps to debug
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }

    /// Default filter directive: dependencies at info, our crates at `self`
    pub fn directive(&self) -> String {
        format!("info,decoynet={lvl},decoynet_core={lvl},decoynet_server={lvl},decoynet_node={lvl}", lvl = self.as_str())
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()))
}

/// Install the global subscriber.
///
/// Panics if a subscriber is already installed; use [`try_init`] where that
/// can happen (tests, embedding).
pub fn init(level: LogLevel) {
    tracing_subscriber::registry()
        .with(fmt_layer::layer())
        .with(filter(level))
        .init();
}

/// Install the global subscriber unless one is already set
pub fn try_init(level: LogLevel) -> Result<(), String> {
    tracing_subscriber::registry()
        .with(fmt_layer::layer())
        .with(filter(level))
        .try_init()
        .map_err(|e| e.to_string())
}

/// Subscriber for tests: writes through the test harness capture
pub fn init_test() {
    let _ = tracing_subscriber::registry()
        .with(fmt_layer::layer().with_test_writer())
        .with(filter(LogLevel::Debug))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_verbose() {
        assert_eq!(LogLevel::from_verbose(true), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbose(false), LogLevel::Info);
    }

    #[test]
    fn test_directive_names_our_crates() {
        let directive = LogLevel::Debug.directive();
        assert!(directive.starts_with("info,"));
        assert!(directive.contains("decoynet_node=debug"));
        assert!(directive.contains("decoynet_server=debug"));
    }

    #[test]
    fn test_try_init_twice() {
        init_test();
        assert!(try_init(LogLevel::Info).is_err());
    }
}
