//! The narrow interfaces the lifecycle coordinator drives.
//!
//! The leak scanner, allocator shim, interceptor tables and thread registry
//! live elsewhere; `Runtime` only sequences them through this trait. The
//! host implementation is `host::HostCollaborators`; tests plug in stubs.

use std::ffi::c_void;
use std::ptr::NonNull;

use lsan_config::{CommonFlags, EnvSource, FixedString};

use crate::unwind::{StackBounds, StackTrace};

/// Normal-exit callback handed to the exit registrar.
pub type ExitHook = extern "C" fn();

/// Executable path, cached for reports.
pub type BinaryName = FixedString<256>;

/// Registry id of the thread that ran initialization.
pub const BOOTSTRAP_THREAD_ID: u32 = 0;

/// A thread registry entry as seen by the unwinder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: u32,
    pub parent: u32,
    pub os_tid: i32,
    pub detached: bool,
    pub started: bool,
    pub stack: StackBounds,
}

/// Machine state at the point a deadly signal was raised.
#[derive(Debug, Clone, Copy)]
pub struct SignalInfo {
    pub signo: i32,
    /// Faulting address from `siginfo_t`, if the signal carries one.
    pub addr: usize,
    pub pc: usize,
    pub bp: usize,
    pub sp: usize,
    pub context: Option<NonNull<c_void>>,
}

/// What the fatal-report path receives.
#[derive(Debug)]
pub struct FatalReport<'a> {
    pub signal: &'a SignalInfo,
    pub stack: &'a StackTrace,
    pub thread: Option<ThreadRecord>,
}

pub trait Collaborators: Sync {
    type Env: EnvSource;

    /// Process environment used by the resolver.
    fn env(&self) -> &Self::Env;

    /// Options string embedded in the instrumented binary, if any.
    fn default_options(&self) -> Option<&str> {
        None
    }

    fn binary_name(&self, _out: &mut BinaryName) {}

    /// Host-specific guard that must run before anything else maps memory.
    fn apply_startup_workaround(&self) {}

    /// Publish verbosity and the report destination.
    fn configure_reporting(&self, flags: &CommonFlags);

    /// Unknown-flag / parse-failure warnings, or the `help` table.
    fn report_text(&self, text: &dyn Fn(&mut dyn std::fmt::Write) -> std::fmt::Result);

    // Leak detector
    fn init_leak_detector(&self);
    /// Run one scan; returns the number of leaks found.
    fn run_leak_check(&self) -> usize;

    // Allocator shim
    fn init_allocator(&self);
    /// Poisoning is not tracked by this tool.
    fn is_address_poisoned(&self, _addr: usize) -> bool {
        false
    }

    // Interceptors
    fn install_allocation_interceptors(&self);
    fn init_tls_layout(&self);
    fn install_interceptors(&self);

    // Thread registry
    fn init_thread_registry(&self);
    fn create_thread(&self, parent: u32, detached: bool) -> u32;
    fn start_thread(&self, id: u32, os_tid: i32);
    fn set_current_thread(&self, id: u32);
    fn current_thread(&self) -> Option<ThreadRecord>;

    /// Install handlers for the deadly signals `flags` selects.
    fn install_signal_bridge(&self, flags: &CommonFlags);
    fn handle_fatal_signal(&self, report: &FatalReport<'_>);

    /// Raw return addresses from the platform unwinder, innermost first.
    fn capture_backtrace(
        &self,
        _context: Option<NonNull<c_void>>,
        frames: &mut [usize],
    ) -> usize {
        crate::unwind::capture_backtrace(frames)
    }

    /// Returns false if the host refused the registration.
    fn register_at_exit(&self, hook: ExitHook) -> bool;

    fn init_coverage(&self, enabled: bool, dir: &str);

    /// Kernel thread id of the caller.
    fn current_os_tid(&self) -> i32 {
        crate::thread::gettid()
    }

    /// Terminate immediately with `code`, skipping further exit hooks.
    fn exit(&self, code: i32) -> ! {
        unsafe { libc::_exit(code) }
    }

    /// Fatal termination with a diagnostic.
    fn die(&self, message: &str) -> ! {
        crate::report::write_all(libc::STDERR_FILENO, message.as_bytes());
        crate::report::write_all(libc::STDERR_FILENO, b"\n");
        unsafe { libc::abort() }
    }
}
