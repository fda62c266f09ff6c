//! Environment access that works before the allocator is usable.

use std::ffi::CStr;

/// Options string consulted after the embedded default-options hook.
pub const OPTIONS_ENV: &CStr = c"LSAN_OPTIONS";

/// Path to an external symbolizer binary.
pub const SYMBOLIZER_ENV: &CStr = c"LSAN_SYMBOLIZER_PATH";

/// Read-only view of a process environment.
pub trait EnvSource {
    /// Value of `key`, or `None` when unset or not valid UTF-8.
    fn var(&self, key: &CStr) -> Option<&str>;
}

/// The live process environment, read through `getenv(3)`.
///
/// `getenv` hands out pointers into `environ` without copying, so this is
/// safe to call from a load-time constructor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &CStr) -> Option<&str> {
        let ptr = unsafe { libc::getenv(key.as_ptr()) };
        if ptr.is_null() {
            return None;
        }
        unsafe { CStr::from_ptr(ptr) }.to_str().ok()
    }
}
