//! Host capabilities, resolved once at compile time.

/// What the platform lets the bootstrap sequence and unwinder do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Asynchronous signal delivery is available.
    pub has_signals: bool,
    /// The allocator can be replaced through symbol interposition.
    pub can_replace_malloc: bool,
    /// `getenv` works this early without allocating.
    pub safe_early_env: bool,
    /// Frame pointers must be checked against the thread's stack bounds
    /// before a fast unwind.
    pub validates_frame_pointers: bool,
    /// The host needs a startup workaround before anything maps memory.
    pub needs_startup_workaround: bool,
    pub can_fast_unwind: bool,
    pub can_slow_unwind: bool,
}

impl Capabilities {
    pub const fn host() -> Self {
        Self {
            has_signals: cfg!(unix),
            can_replace_malloc: cfg!(any(target_os = "linux", target_os = "android")),
            safe_early_env: true,
            validates_frame_pointers: cfg!(any(target_arch = "mips", target_arch = "mips64")),
            needs_startup_workaround: cfg!(target_arch = "s390x"),
            can_fast_unwind: !cfg!(any(target_arch = "s390x", target_arch = "riscv64")),
            can_slow_unwind: true,
        }
    }

    /// Whether a request that prefers the fast unwinder will get it.
    pub fn will_use_fast_unwind(&self, request_fast: bool) -> bool {
        if !self.can_fast_unwind {
            return false;
        }
        if !self.can_slow_unwind {
            return true;
        }
        request_fast
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::host()
    }
}
