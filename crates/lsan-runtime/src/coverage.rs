//! Edge-coverage hooks.
//!
//! Binaries built with `-fsanitize-coverage=trace-pc-guard` call into the
//! guard callbacks; each guard gets a small index and we remember which
//! indices fired. With `coverage=1` the set is written at exit to
//! `<coverage_dir>/<binary>.<pid>.cov`, one guard index per line.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use lsan_config::FlagPath;
use once_cell::sync::OnceCell;

use crate::macros::StackWriter;
use crate::report::write_all;

/// Guards beyond this index are counted but not recorded.
pub const MAX_GUARDS: usize = 1 << 16;

#[allow(clippy::declare_interior_mutable_const)]
const UNHIT: AtomicU8 = AtomicU8::new(0);

pub struct CoverageMap {
    enabled: AtomicBool,
    dir: OnceCell<FlagPath>,
    next_guard: AtomicU32,
    hits: [AtomicU8; MAX_GUARDS],
}

impl CoverageMap {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            dir: OnceCell::new(),
            // Index 0 means "not yet assigned".
            next_guard: AtomicU32::new(1),
            hits: [UNHIT; MAX_GUARDS],
        }
    }

    /// Record settings. Returns true when collection is on.
    pub fn init(&self, enabled: bool, dir: &str) -> bool {
        if enabled {
            let _ = self.dir.set(FlagPath::with(dir));
            self.enabled.store(true, Ordering::Release);
        }
        enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Number guards in `[start, stop)`. A module whose first guard is
    /// already numbered was seen before and is skipped.
    ///
    /// # Safety
    /// `start..stop` must be a writable guard array.
    pub unsafe fn assign_guards(&self, start: *mut u32, stop: *mut u32) {
        if start == stop || *start != 0 {
            return;
        }
        let mut guard = start;
        while guard < stop {
            *guard = self.next_guard.fetch_add(1, Ordering::Relaxed);
            guard = guard.add(1);
        }
    }

    /// # Safety
    /// `guard` must point at a guard numbered by `assign_guards`.
    #[inline]
    pub unsafe fn hit(&self, guard: *const u32) {
        let index = *guard as usize;
        if index != 0 && index < MAX_GUARDS {
            self.hits[index].store(1, Ordering::Relaxed);
        }
    }

    pub fn guard_count(&self) -> u32 {
        self.next_guard.load(Ordering::Relaxed) - 1
    }

    pub fn covered(&self) -> impl Iterator<Item = u32> + '_ {
        self.hits
            .iter()
            .enumerate()
            .filter(|(_, h)| h.load(Ordering::Relaxed) != 0)
            .map(|(i, _)| i as u32)
    }

    /// Write the covered set for `binary`/`pid`. Returns the number of
    /// guards written, or `None` if collection is off or the file could
    /// not be created.
    pub fn dump(&self, binary: &str, pid: i32) -> Option<usize> {
        use std::fmt::Write;

        if !self.is_enabled() {
            return None;
        }
        let dir = self.dir.get().map(|d| d.as_str()).unwrap_or(".");
        let base = binary.rsplit('/').next().filter(|b| !b.is_empty()).unwrap_or("unknown");

        let mut path_buf = [0u8; FlagPath::CAPACITY + 320];
        let path_cap = path_buf.len() - 1;
        let mut path = StackWriter::new(&mut path_buf[..path_cap]);
        let _ = write!(path, "{}/{}.{}.cov", dir, base, pid);
        if path.is_full() {
            return None;
        }

        let fd = unsafe {
            libc::open(
                path_buf.as_ptr() as *const libc::c_char,
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
                0o644,
            )
        };
        if fd < 0 {
            return None;
        }

        let mut written = 0;
        let mut line = [0u8; 64];
        {
            let mut header = StackWriter::new(&mut line);
            let total = self.guard_count();
            let _ = writeln!(header, "# guards: {}", total);
            write_all(fd, header.as_str().as_bytes());
        }
        for index in self.covered() {
            let mut w = StackWriter::new(&mut line);
            let _ = writeln!(w, "{}", index);
            write_all(fd, w.as_str().as_bytes());
            written += 1;
        }
        unsafe { libc::close(fd) };
        Some(written)
    }
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new()
    }
}

pub static COVERAGE: CoverageMap = CoverageMap::new();
