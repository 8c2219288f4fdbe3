//! Botlink Logging
//!
//! One place to initialise tracing for the daemon, the CLI and tests, so
//! every binary formats and filters the same way. `RUST_LOG` overrides the
//! level chosen in code.

use tracing_subscriber::EnvFilter;

/// Log level for the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map the usual `--verbose` flag onto a level.
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Self::Debug
        } else {
            Self::Info
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Initialise logging once at startup.
///
/// # Panics
///
/// Panics if a subscriber is already installed; use [`try_init`] to handle
/// that case.
pub fn init(level: LogLevel) {
    try_init(level).expect("failed to initialize logging");
}

/// Like [`init`], but reports an already-installed subscriber instead of
/// panicking. Handy in tests, where several cases may race to initialise.
pub fn try_init(level: LogLevel) -> Result<(), String> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_flag_selects_debug() {
        assert_eq!(LogLevel::from_verbose(false), LogLevel::Info);
        assert_eq!(LogLevel::from_verbose(true), LogLevel::Debug);
    }

    #[test]
    fn levels_render_as_filter_directives() {
        assert_eq!(LogLevel::Error.as_str(), "error");
        assert_eq!(LogLevel::Warn.as_str(), "warn");
        assert_eq!(LogLevel::Info.as_str(), "info");
        assert_eq!(LogLevel::Debug.as_str(), "debug");
        assert_eq!(LogLevel::Trace.as_str(), "trace");
    }

    #[test]
    fn default_level_is_info() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }
}
