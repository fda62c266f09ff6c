//! Test helpers shared by the workspace.
//!
//! - `MapEnv`: an in-memory `EnvSource`
//! - `TestEnvironment`: an isolated temp directory for log-path and
//!   snapshot tests
//!
//! # Usage
//!
//! ```ignore
//! use lsan_config::testing::{MapEnv, TestEnvironment};
//!
//! let env = TestEnvironment::new()?;
//! let opts = env.options_with_log_path("verbosity=1");
//! // spawn with LSAN_OPTIONS=opts, then env.read_log(child_pid)
//! ```

use std::collections::HashMap;
use std::ffi::CStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

use crate::env::EnvSource;

/// In-memory environment.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }
}

impl EnvSource for MapEnv {
    fn var(&self, key: &CStr) -> Option<&str> {
        self.vars.get(key.to_str().ok()?).map(String::as_str)
    }
}

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated directory for tests that make the runtime write files.
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Directory holding `<prefix>.<pid>` report files
    pub log_dir: PathBuf,
    /// Value to pass as `log_path`
    pub log_prefix: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let log_dir = temp_dir.path().join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let log_prefix = log_dir.join(format!("lsan-{}", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            log_dir,
            log_prefix,
            test_id,
        })
    }

    /// `extra` with `log_path` pointed into this environment.
    pub fn options_with_log_path(&self, extra: &str) -> String {
        let log_path = format!("log_path='{}'", self.log_prefix.display());
        if extra.is_empty() {
            log_path
        } else {
            format!("{}:{}", extra, log_path)
        }
    }

    /// Report file the runtime writes for `pid`.
    pub fn log_file(&self, pid: u32) -> PathBuf {
        let mut name = self.log_prefix.clone().into_os_string();
        name.push(format!(".{}", pid));
        PathBuf::from(name)
    }

    /// Read the report for `pid`, empty if nothing was written.
    pub fn read_log(&self, pid: u32) -> String {
        std::fs::read_to_string(self.log_file(pid)).unwrap_or_default()
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
