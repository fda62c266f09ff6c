//! Structured logging for the leak-runtime tooling.
//!
//! These macros go through `tracing` and are meant for the CLI and other
//! host-side code. The preloaded runtime never uses them: it logs through
//! its own raw-write reporter because `tracing` may allocate.
//!
//! # Usage
//!
//! ```ignore
//! use lsan_config::logging::*;
//!
//! log_cli_info!("Spawning target", pid = child.id());
//! log_config_debug!("Resolved flags", verbosity = flags.common.verbosity);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const CONFIG: &'static str = "CONFIG";
    pub const CLI: &'static str = "CLI";
    pub const RUNTIME: &'static str = "RUNTIME";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map the runtime's `verbosity` flag onto a tracing level.
    pub fn from_verbosity(verbosity: i32) -> Self {
        match verbosity {
            i32::MIN..=0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === CONFIG logging macros ===

#[macro_export]
macro_rules! log_config_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "CONFIG", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_config_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CONFIG", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "CLI", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cli_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "CLI", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CLI", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CLI", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup. `RUST_LOG` still takes priority.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
