// =============================================================================
// host.rs: Process-wide runtime instance
// =============================================================================
//
// `HostCollaborators` wires the lifecycle coordinator to the real process:
// getenv, /proc/self/exe, sigaction, atexit, pthread keys. The scanner
// proper is plugged in with `set_leak_checker`; until then a scan reports
// nothing.
// =============================================================================

use std::ffi::{c_void, CStr};
use std::fmt;

use lsan_config::{CommonFlags, EnvSource, ProcessEnv, TOOL_NAME};
use once_cell::sync::OnceCell;

use crate::capabilities::Capabilities;
use crate::collab::{BinaryName, Collaborators, ExitHook, FatalReport, ThreadRecord};
use crate::coverage::COVERAGE;
use crate::report::{self, ReportWriter};
use crate::signal;
use crate::state::Runtime;
use crate::thread::{self, ThreadRegistry};
use crate::tls;

/// The process's runtime instance.
pub static RUNTIME: Runtime<HostCollaborators> =
    Runtime::new(HostCollaborators::new(), Capabilities::host(), host_exit_hook);

extern "C" fn host_exit_hook() {
    RUNTIME.run_exit_check();
}

static REGISTRY: ThreadRegistry = ThreadRegistry::new();
static DEFAULT_OPTIONS: OnceCell<&'static str> = OnceCell::new();
static LEAK_CHECKER: OnceCell<fn() -> usize> = OnceCell::new();

/// Embed an options string, consulted before `LSAN_OPTIONS`. Must be called
/// before initialization; returns false if one was already set.
pub fn set_default_options(options: &'static str) -> bool {
    DEFAULT_OPTIONS.set(options).is_ok()
}

/// Plug in the heap scanner. Returns false if one was already set.
pub fn set_leak_checker(check: fn() -> usize) -> bool {
    LEAK_CHECKER.set(check).is_ok()
}

/// `__lsan_default_options` from the instrumented binary, if it defines one.
fn default_options_symbol() -> Option<&'static str> {
    type DefaultOptionsFn = unsafe extern "C" fn() -> *const libc::c_char;

    let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"__lsan_default_options".as_ptr()) };
    if sym.is_null() {
        return None;
    }
    let func: DefaultOptionsFn = unsafe { std::mem::transmute(sym) };
    let ptr = unsafe { func() };
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Longest valid UTF-8 prefix of `bytes`. A truncated `readlink` can end
/// in the middle of a character.
fn utf8_prefix(bytes: &[u8]) -> &str {
    match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or(""),
    }
}

const CVE_2016_2143_ENV: &CStr = c"SANITIZER_IGNORE_CVE_2016_2143";

/// Kernels before 4.5 can corrupt page tables when a process maps memory
/// above 4TiB on s390x.
pub fn kernel_is_affected_by_cve_2016_2143(release: &str) -> bool {
    let mut parts = release
        .split(|c: char| !c.is_ascii_digit())
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    (major, minor) < (4, 5)
}

fn kernel_release(buf: &mut libc::utsname) -> Option<&str> {
    if unsafe { libc::uname(buf) } != 0 {
        return None;
    }
    unsafe { CStr::from_ptr(buf.release.as_ptr()) }.to_str().ok()
}

/// Write the deadly-signal report.
pub fn write_fatal_report(
    out: &mut dyn fmt::Write,
    pid: i32,
    report: &FatalReport<'_>,
) -> fmt::Result {
    let sig = report.signal;
    let name = signal::signal_name(sig.signo);
    write!(
        out,
        "=={}==ERROR: {}: {} on unknown address 0x{:x} (pc 0x{:x} bp 0x{:x} sp 0x{:x} T",
        pid, TOOL_NAME, name, sig.addr, sig.pc, sig.bp, sig.sp
    )?;
    match report.thread {
        Some(t) => writeln!(out, "{})", t.id)?,
        None => out.write_str("?)\n")?,
    }
    report.stack.write_frames(out)?;
    writeln!(out)?;
    writeln!(out, "SUMMARY: {}: {}", TOOL_NAME, name)
}

extern "C" fn deadly_signal_handler(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut c_void,
) {
    if !signal::enter_deadly_signal() {
        // The report path itself crashed.
        let code = RUNTIME.flags().map(|f| f.common.exitcode).unwrap_or(1);
        unsafe { libc::_exit(code) }
    }
    let info = unsafe { signal::signal_info(signo, info, ucontext) };
    RUNTIME.on_deadly_signal(&info)
}

extern "C" fn coverage_atexit() {
    let pid = unsafe { libc::getpid() };
    match COVERAGE.dump(RUNTIME.binary_name(), pid) {
        Some(n) => rt_vreport!(1, "{}: wrote {} covered guard(s)", TOOL_NAME, n),
        None => rt_report!("WARNING: {}: could not write coverage data", TOOL_NAME),
    }
}

pub struct HostCollaborators {
    env: ProcessEnv,
}

impl HostCollaborators {
    pub const fn new() -> Self {
        Self { env: ProcessEnv }
    }
}

impl Default for HostCollaborators {
    fn default() -> Self {
        Self::new()
    }
}

impl Collaborators for HostCollaborators {
    type Env = ProcessEnv;

    fn env(&self) -> &ProcessEnv {
        &self.env
    }

    fn default_options(&self) -> Option<&str> {
        DEFAULT_OPTIONS.get().copied().or_else(default_options_symbol)
    }

    fn binary_name(&self, out: &mut BinaryName) {
        let mut buf = [0u8; BinaryName::CAPACITY];
        let n = unsafe {
            libc::readlink(
                c"/proc/self/exe".as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if n > 0 {
            out.set(utf8_prefix(&buf[..n as usize]));
        }
    }

    fn apply_startup_workaround(&self) {
        if self.env.var(CVE_2016_2143_ENV).is_some() {
            return;
        }
        let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
        let Some(release) = kernel_release(&mut uts) else { return };
        if kernel_is_affected_by_cve_2016_2143(release) {
            self.die(
                "ERROR: kernel is vulnerable to CVE-2016-2143; upgrade to 4.5+ or set \
                 SANITIZER_IGNORE_CVE_2016_2143=1",
            );
        }
    }

    fn configure_reporting(&self, flags: &CommonFlags) {
        report::set_verbosity(flags.verbosity);
        report::set_report_path(flags.log_path.as_str());
    }

    fn report_text(&self, text: &dyn Fn(&mut dyn fmt::Write) -> fmt::Result) {
        let _ = text(&mut ReportWriter::global());
    }

    fn init_leak_detector(&self) {
        if LEAK_CHECKER.get().is_none() {
            rt_vreport!(1, "{}: no heap scanner registered; scans report 0 leaks", TOOL_NAME);
        }
    }

    fn run_leak_check(&self) -> usize {
        LEAK_CHECKER.get().map(|check| check()).unwrap_or(0)
    }

    fn init_allocator(&self) {
        rt_vreport!(2, "{}: using the system allocator", TOOL_NAME);
    }

    fn install_allocation_interceptors(&self) {
        rt_vreport!(2, "{}: allocation interceptors come from the preloaded scanner", TOOL_NAME);
    }

    fn init_tls_layout(&self) {
        let size = tls::init_tls_size();
        rt_vreport!(2, "{}: static TLS size {} bytes", TOOL_NAME, size);
    }

    fn install_interceptors(&self) {
        rt_vreport!(2, "{}: no extra interceptors to install", TOOL_NAME);
    }

    fn init_thread_registry(&self) {
        if !REGISTRY.init() {
            self.die("LeakSanitizer: CHECK failed: could not create the thread registry key");
        }
    }

    fn create_thread(&self, parent: u32, detached: bool) -> u32 {
        match REGISTRY.create(parent, detached) {
            Some(id) => id,
            None => self.die("LeakSanitizer: CHECK failed: thread registry is full"),
        }
    }

    fn start_thread(&self, id: u32, os_tid: i32) {
        REGISTRY.start(id, os_tid, thread::current_stack_bounds());
    }

    fn set_current_thread(&self, id: u32) {
        REGISTRY.set_current(id);
    }

    fn current_thread(&self) -> Option<ThreadRecord> {
        REGISTRY.current()
    }

    fn install_signal_bridge(&self, flags: &CommonFlags) {
        let installed = signal::install(flags, deadly_signal_handler);
        rt_vreport!(1, "{}: installed {} deadly-signal handler(s)", TOOL_NAME, installed);
    }

    fn handle_fatal_signal(&self, report: &FatalReport<'_>) {
        let pid = unsafe { libc::getpid() };
        let _ = write_fatal_report(&mut ReportWriter::global(), pid, report);
    }

    fn register_at_exit(&self, hook: ExitHook) -> bool {
        unsafe { libc::atexit(hook) == 0 }
    }

    fn init_coverage(&self, enabled: bool, dir: &str) {
        if COVERAGE.init(enabled, dir) && unsafe { libc::atexit(coverage_atexit) } != 0 {
            rt_report!("WARNING: {}: could not register the coverage dump", TOOL_NAME);
        }
    }

    fn die(&self, message: &str) -> ! {
        rt_report!("{}", message);
        unsafe { libc::abort() }
    }
}
