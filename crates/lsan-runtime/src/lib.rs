//! # lsan-runtime
//!
//! Bootstrap and lifecycle coordinator for the LeakSanitizer runtime.
//!
//! Brings the runtime up exactly once, before user code when loaded with
//! `LD_PRELOAD`: resolves flags, sequences the scanner, allocator, TLS,
//! interceptor and thread-registry collaborators, installs the deadly-signal
//! bridge and arms the exit-time leak check.
//!
//! # Constraints on the init path
//!
//! Bring-up can run from `.init_array` before libc has finished setting up
//! the process. Code reachable from `Runtime::initialize` or a signal
//! handler must not:
//! - allocate (`String`, `Vec`, `Box`)
//! - use stdio (`println!`/`eprintln!`); use `rt_report!` instead
//! - panic; report and `die` instead
//!
//! # C entry points
//!
//! | Symbol | Effect |
//! |---|---|
//! | `__lsan_init` | idempotent initialization |
//! | `__lsan_do_leak_check` | one-shot check, exits with `exitcode` on leaks |
//! | `__lsan_do_recoverable_leak_check` | repeatable check, returns nonzero on leaks |
//! | `__sanitizer_print_stack_trace` | print the caller's stack |

#![allow(clippy::missing_safety_doc)]

// Macros must be defined before modules that use them
#[macro_use]
pub mod macros;

pub mod capabilities;
pub mod collab;
pub mod coverage;
pub mod host;
pub mod report;
pub mod signal;
pub mod state;
pub mod thread;
pub mod tls;
pub mod unwind;

pub use capabilities::Capabilities;
pub use collab::{
    BinaryName, Collaborators, ExitHook, FatalReport, SignalInfo, ThreadRecord,
    BOOTSTRAP_THREAD_ID,
};
pub use host::{set_default_options, set_leak_checker, HostCollaborators, RUNTIME};
pub use state::{InitState, Runtime};
pub use unwind::{StackBounds, StackTrace, UnwindRequest, MAX_STACK_FRAMES};

/// Program counter and frame pointer of the caller.
#[inline(always)]
fn current_pc_bp() -> (usize, usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let (pc, bp): (usize, usize);
        unsafe {
            std::arch::asm!("lea {}, [rip]", out(reg) pc, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, rbp", out(reg) bp, options(nomem, nostack, preserves_flags));
        }
        (pc, bp)
    }
    #[cfg(target_arch = "aarch64")]
    {
        let (pc, bp): (usize, usize);
        unsafe {
            std::arch::asm!("adr {}, .", out(reg) pc, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x29", out(reg) bp, options(nomem, nostack, preserves_flags));
        }
        (pc, bp)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let mut frames = [0usize; 1];
        unwind::capture_backtrace(&mut frames);
        (frames[0], 0)
    }
}

#[no_mangle]
pub extern "C" fn __lsan_init() {
    RUNTIME.initialize();
}

#[no_mangle]
pub extern "C" fn __lsan_do_leak_check() {
    RUNTIME.do_leak_check();
}

#[no_mangle]
pub extern "C" fn __lsan_do_recoverable_leak_check() -> libc::c_int {
    (RUNTIME.do_recoverable_leak_check() > 0) as libc::c_int
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn __sanitizer_print_stack_trace() {
    let (pc, bp) = current_pc_bp();
    RUNTIME.print_stack_trace(pc, bp);
}

/// Guard callbacks for `-fsanitize-coverage=trace-pc-guard`. Exported only
/// from the preload build so an ordinary link never claims them.
#[cfg(feature = "preload")]
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(start: *mut u32, stop: *mut u32) {
    coverage::COVERAGE.assign_guards(start, stop);
}

#[cfg(feature = "preload")]
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
    coverage::COVERAGE.hit(guard);
}

/// Load-time constructor: initialize before `main` when preloaded.
#[cfg(all(feature = "preload", target_os = "linux"))]
#[link_section = ".init_array"]
#[used]
pub static LSAN_PRELOAD_INIT: extern "C" fn() = {
    extern "C" fn preinit() {
        RUNTIME.initialize();
    }
    preinit
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_pc_is_in_text() {
        let (pc, _) = current_pc_bp();
        assert!(pc > unwind::page_size());
    }

    #[test]
    fn test_recoverable_check_before_init_is_clean() {
        // The global instance is never initialized by unit tests.
        assert_eq!(__lsan_do_recoverable_leak_check(), 0);
        assert!(!RUNTIME.is_initialized());
    }
}
