//! Deadly-signal bridge.
//!
//! Installs `SA_SIGINFO` handlers for the signals the flags select and turns
//! the kernel's `siginfo_t`/`ucontext_t` into a `SignalInfo`. The handler
//! itself is supplied by the owner of the runtime instance.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use lsan_config::CommonFlags;

use crate::collab::SignalInfo;

pub type RawSignalHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void);

/// Deadly signals and whether `flags` asks for each one.
pub fn selected_signals(flags: &CommonFlags) -> [(libc::c_int, bool); 5] {
    [
        (libc::SIGSEGV, flags.handle_segv),
        (libc::SIGBUS, flags.handle_sigbus),
        (libc::SIGABRT, flags.handle_abort),
        (libc::SIGILL, flags.handle_sigill),
        (libc::SIGFPE, flags.handle_sigfpe),
    ]
}

pub fn signal_name(signo: libc::c_int) -> &'static str {
    match signo {
        libc::SIGSEGV => "SEGV",
        libc::SIGBUS => "BUS",
        libc::SIGABRT => "ABRT",
        libc::SIGILL => "ILL",
        libc::SIGFPE => "FPE",
        _ => "UNKNOWN SIGNAL",
    }
}

/// Smallest alternate stack the report path fits on: unwinder state, a
/// stack trace and the formatting buffers.
pub const ALT_STACK_SIZE: usize = 64 * 1024;

/// The calling thread's current alternate stack, if one is enabled.
pub fn current_alternate_stack() -> Option<libc::stack_t> {
    unsafe {
        let mut current: libc::stack_t = std::mem::zeroed();
        if libc::sigaltstack(std::ptr::null(), &mut current) != 0 {
            return None;
        }
        if current.ss_flags & libc::SS_DISABLE != 0 || current.ss_sp.is_null() {
            return None;
        }
        Some(current)
    }
}

/// Give the calling thread an alternate signal stack so a stack overflow
/// can still be reported. An existing one is kept only if it is at least
/// `ALT_STACK_SIZE`. Returns false if the host refused.
pub fn setup_alternate_stack() -> bool {
    if let Some(current) = current_alternate_stack() {
        if current.ss_size >= ALT_STACK_SIZE {
            return true;
        }
    }
    unsafe {
        let size = std::cmp::max(libc::SIGSTKSZ, ALT_STACK_SIZE);
        let mem = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if mem == libc::MAP_FAILED {
            return false;
        }
        let stack = libc::stack_t {
            ss_sp: mem,
            ss_flags: 0,
            ss_size: size,
        };
        if libc::sigaltstack(&stack, std::ptr::null_mut()) != 0 {
            libc::munmap(mem, size);
            return false;
        }
        true
    }
}

/// Install `handler` for every selected deadly signal. Returns how many
/// handlers were installed.
pub fn install(flags: &CommonFlags, handler: RawSignalHandler) -> usize {
    let on_stack = flags.use_sigaltstack && setup_alternate_stack();
    let mut installed = 0;
    for (signo, wanted) in selected_signals(flags) {
        if !wanted {
            continue;
        }
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
            if on_stack {
                action.sa_flags |= libc::SA_ONSTACK;
            }
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signo, &action, std::ptr::null_mut()) == 0 {
                installed += 1;
            }
        }
    }
    installed
}

static IN_DEADLY_SIGNAL: AtomicBool = AtomicBool::new(false);

/// Marks the process as handling a deadly signal. Returns false if one is
/// already being handled, i.e. the report path itself crashed.
pub fn enter_deadly_signal() -> bool {
    !IN_DEADLY_SIGNAL.swap(true, Ordering::AcqRel)
}

/// Decode the kernel's view of the faulting thread.
///
/// # Safety
/// `info` and `ucontext` must be the pointers the kernel passed to an
/// `SA_SIGINFO` handler (or null).
pub unsafe fn signal_info(
    signo: libc::c_int,
    info: *const libc::siginfo_t,
    ucontext: *mut c_void,
) -> SignalInfo {
    let addr = if info.is_null() {
        0
    } else {
        fault_address(&*info)
    };
    let (pc, bp, sp) = registers(ucontext);
    SignalInfo {
        signo,
        addr,
        pc,
        bp,
        sp,
        context: NonNull::new(ucontext),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: &libc::siginfo_t) -> usize {
    info.si_addr() as usize
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: &libc::siginfo_t) -> usize {
    info.si_addr as usize
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn registers(ucontext: *mut c_void) -> (usize, usize, usize) {
    if ucontext.is_null() {
        return (0, 0, 0);
    }
    let uc = &*(ucontext as *const libc::ucontext_t);
    let gregs = &uc.uc_mcontext.gregs;
    (
        gregs[libc::REG_RIP as usize] as usize,
        gregs[libc::REG_RBP as usize] as usize,
        gregs[libc::REG_RSP as usize] as usize,
    )
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn registers(ucontext: *mut c_void) -> (usize, usize, usize) {
    if ucontext.is_null() {
        return (0, 0, 0);
    }
    let uc = &*(ucontext as *const libc::ucontext_t);
    let mc = &uc.uc_mcontext;
    (mc.pc as usize, mc.regs[29] as usize, mc.sp as usize)
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
unsafe fn registers(_ucontext: *mut c_void) -> (usize, usize, usize) {
    (0, 0, 0)
}
