// =============================================================================
// report.rs: Raw report destination
// =============================================================================
//
// All runtime output funnels through here: `stderr`, `stdout`, or a file
// named `<log_path>.<pid>` opened on first use. No allocation, no stdio
// buffering. The spin lock guards (re)configuration; the write path only
// ever tries it a bounded number of times.
// =============================================================================

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use lsan_config::FlagPath;

use crate::macros::StackWriter;

static VERBOSITY: AtomicI32 = AtomicI32::new(0);

pub fn set_verbosity(level: i32) {
    VERBOSITY.store(level, Ordering::Relaxed);
}

#[inline]
pub fn verbosity() -> i32 {
    VERBOSITY.load(Ordering::Relaxed)
}

const FD_UNOPENED: i32 = -1;

const TRY_LOCK_SPINS: usize = 1 << 12;

pub struct ReportFile {
    lock: AtomicBool,
    path: UnsafeCell<FlagPath>,
    fd: AtomicI32,
}

// Safety: `path` is only touched with `lock` held.
unsafe impl Sync for ReportFile {}

impl ReportFile {
    pub const fn new() -> Self {
        Self {
            lock: AtomicBool::new(false),
            path: UnsafeCell::new(FlagPath::new()),
            fd: AtomicI32::new(libc::STDERR_FILENO),
        }
    }

    fn acquire(&self) {
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    /// `acquire` that gives up after a bounded spin. The deadly-signal path
    /// writes through here and may have interrupted the lock holder.
    fn try_acquire(&self) -> bool {
        for _ in 0..TRY_LOCK_SPINS {
            if self
                .lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Point reports at `stderr`, `stdout`, or `<path>.<pid>`.
    pub fn set_path(&self, path: &str) {
        self.acquire();
        let old = self.fd.load(Ordering::Relaxed);
        if old > libc::STDERR_FILENO {
            unsafe { libc::close(old) };
        }
        let fd = match path {
            "" | "stderr" => libc::STDERR_FILENO,
            "stdout" => libc::STDOUT_FILENO,
            _ => {
                unsafe { (*self.path.get()).set(path) };
                FD_UNOPENED
            }
        };
        self.fd.store(fd, Ordering::Release);
        self.release();
    }

    /// Descriptor to write to, opening the per-pid file on first use.
    /// Falls back to stderr if the lock stays contended.
    pub fn fd(&self) -> i32 {
        let fd = self.fd.load(Ordering::Acquire);
        if fd != FD_UNOPENED {
            return fd;
        }

        if !self.try_acquire() {
            return libc::STDERR_FILENO;
        }
        let mut fd = self.fd.load(Ordering::Relaxed);
        if fd == FD_UNOPENED {
            fd = unsafe { self.open_locked() };
            self.fd.store(fd, Ordering::Release);
        }
        self.release();
        fd
    }

    /// Caller holds `lock`.
    unsafe fn open_locked(&self) -> i32 {
        use std::fmt::Write;

        let mut buf = [0u8; FlagPath::CAPACITY + 32];
        let mut name = StackWriter::new(&mut buf[..FlagPath::CAPACITY + 31]);
        let _ = write!(name, "{}.{}", (*self.path.get()).as_str(), libc::getpid());
        let len = name.as_str().len();
        // buf[len] is still zero: the writer never touches the last byte.
        let fd = libc::open(
            buf.as_ptr() as *const libc::c_char,
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644,
        );
        if fd >= 0 {
            return fd;
        }

        let msg = b"LeakSanitizer: cannot open log file, falling back to stderr: ";
        write_all(libc::STDERR_FILENO, msg);
        write_all(libc::STDERR_FILENO, &buf[..len]);
        write_all(libc::STDERR_FILENO, b"\n");
        libc::STDERR_FILENO
    }

    pub fn write(&self, s: &str) {
        write_all(self.fd(), s.as_bytes());
    }
}

impl Default for ReportFile {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReportFile {
    fn drop(&mut self) {
        let fd = *self.fd.get_mut();
        if fd > libc::STDERR_FILENO {
            unsafe { libc::close(fd) };
        }
    }
}

/// `write(2)` until done, retrying on `EINTR`. Errors are dropped.
pub fn write_all(fd: i32, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

pub static REPORT_FILE: ReportFile = ReportFile::new();

pub fn set_report_path(path: &str) {
    REPORT_FILE.set_path(path);
}

pub fn write_report(s: &str) {
    REPORT_FILE.write(s);
}

/// Unbuffered `fmt::Write` into a report destination, for output too long
/// for a single stack buffer.
pub struct ReportWriter<'a> {
    file: &'a ReportFile,
}

impl<'a> ReportWriter<'a> {
    pub fn new(file: &'a ReportFile) -> Self {
        Self { file }
    }
}

impl ReportWriter<'static> {
    pub fn global() -> Self {
        Self::new(&REPORT_FILE)
    }
}

impl fmt::Write for ReportWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.file.write(s);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_verbosity_roundtrip() {
        let before = verbosity();
        set_verbosity(before + 2);
        assert_eq!(verbosity(), before + 2);
        set_verbosity(before);
    }

    #[test]
    fn test_std_destinations() {
        let file = ReportFile::new();
        assert_eq!(file.fd(), libc::STDERR_FILENO);
        file.set_path("stdout");
        assert_eq!(file.fd(), libc::STDOUT_FILENO);
        file.set_path("stderr");
        assert_eq!(file.fd(), libc::STDERR_FILENO);
    }

    #[test]
    fn test_log_path_opens_pid_file_lazily() {
        let env = lsan_config::testing::TestEnvironment::new().unwrap();
        let file = ReportFile::new();
        file.set_path(env.log_prefix.to_str().unwrap());

        let pid = std::process::id();
        assert!(!env.log_file(pid).exists());

        let mut w = ReportWriter::new(&file);
        write!(w, "leak of {} byte(s)\n", 16).unwrap();
        file.write("done\n");

        assert_eq!(env.read_log(pid), "leak of 16 byte(s)\ndone\n");
    }

    #[test]
    fn test_contended_lock_falls_back_to_stderr() {
        let env = lsan_config::testing::TestEnvironment::new().unwrap();
        let file = ReportFile::new();
        file.set_path(env.log_prefix.to_str().unwrap());

        file.acquire();
        assert_eq!(file.fd(), libc::STDERR_FILENO);
        file.release();

        let fd = file.fd();
        assert!(fd > libc::STDERR_FILENO);
        assert!(env.log_file(std::process::id()).exists());
    }

    #[test]
    fn test_unopenable_path_falls_back_to_stderr() {
        let file = ReportFile::new();
        file.set_path("/proc/no/such/dir/log");
        assert_eq!(file.fd(), libc::STDERR_FILENO);
    }
}
