//! # lsan-config
//!
//! Flag model and option-string resolution for the leak runtime.
//!
//! Resolution order (later wins per key):
//! 1. built-in defaults, then the values the tool forces
//! 2. the embedded default-options string
//! 3. `LSAN_OPTIONS`
//!
//! Everything on the resolution path is allocation-free so the runtime can
//! call it from a load-time constructor.

pub mod env;
pub mod error;
pub mod fixed;
pub mod flags;
pub mod logging;
pub mod parser;
pub mod resolve;
pub mod testing;

use std::path::Path;

pub use env::{EnvSource, ProcessEnv, OPTIONS_ENV, SYMBOLIZER_ENV};
pub use error::{ConfigError, ParseError};
pub use fixed::FixedString;
pub use flags::{CommonFlags, FlagInfo, FlagPath, Flags, LsanFlags, LEAK_EXIT_CODE, TOOL_NAME};
pub use parser::{FlagParser, UnknownFlags, MAX_UNKNOWN_FLAGS};
pub use resolve::{resolve, Diagnostic, OptionSource, OptionSources, Resolution};

impl Flags {
    /// Persist the snapshot as TOML, creating parent directories.
    pub fn write_toml(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        crate::log_config_debug!(
            "Writing flag snapshot",
            path = tracing::field::display(path.display())
        );
        std::fs::write(path, contents)?;
        Ok(())
    }
}
