//! Host thread registry.
//!
//! A fixed table of slots guarded by a spin lock, plus a pthread key that
//! maps the calling thread to its slot. Lookups of the current thread are
//! async-signal-safe: `pthread_getspecific` and a copy out of the table.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::collab::ThreadRecord;
use crate::unwind::StackBounds;

/// Most threads the registry tracks at once.
pub const MAX_THREADS: usize = 1024;

/// Kernel thread id of the caller.
pub fn gettid() -> i32 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        unsafe { libc::syscall(libc::SYS_gettid) as i32 }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        unsafe { libc::pthread_self() as usize as i32 }
    }
}

/// Stack bounds of the calling thread.
pub fn current_stack_bounds() -> Option<StackBounds> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }
        let bottom = addr as usize;
        Some(StackBounds {
            bottom,
            top: bottom + size,
        })
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        None
    }
}

#[derive(Clone, Copy)]
struct Slot {
    used: bool,
    record: ThreadRecord,
}

const EMPTY_SLOT: Slot = Slot {
    used: false,
    record: ThreadRecord {
        id: 0,
        parent: 0,
        os_tid: 0,
        detached: false,
        started: false,
        stack: StackBounds { bottom: 0, top: 0 },
    },
};

pub struct ThreadRegistry {
    lock: AtomicBool,
    slots: UnsafeCell<[Slot; MAX_THREADS]>,
    next_id: AtomicUsize,
    key: AtomicUsize,
}

/// `key` before `init` has run. Zero is a valid pthread key.
const NO_KEY: usize = usize::MAX;

const TRY_LOCK_SPINS: usize = 1 << 12;

// Safety: `slots` is only written with `lock` held; readers copy a slot
// out under the same lock.
unsafe impl Sync for ThreadRegistry {}

/// Key slot values are `id + 1` so that null means "unregistered".
fn encode_id(id: u32) -> *mut libc::c_void {
    (id as usize + 1) as *mut libc::c_void
}

impl ThreadRegistry {
    #[allow(clippy::large_stack_frames)] // const fn for static init
    pub const fn new() -> Self {
        Self {
            lock: AtomicBool::new(false),
            slots: UnsafeCell::new([EMPTY_SLOT; MAX_THREADS]),
            next_id: AtomicUsize::new(0),
            key: AtomicUsize::new(NO_KEY),
        }
    }

    fn with_slots<R>(&self, f: impl FnOnce(&mut [Slot; MAX_THREADS]) -> R) -> R {
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let out = f(unsafe { &mut *self.slots.get() });
        self.lock.store(false, Ordering::Release);
        out
    }

    /// `with_slots` that gives up instead of spinning forever. Used on the
    /// signal path, where the interrupted thread may hold the lock.
    fn try_with_slots<R>(&self, f: impl FnOnce(&[Slot; MAX_THREADS]) -> R) -> Option<R> {
        for _ in 0..TRY_LOCK_SPINS {
            if self
                .lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                let out = f(unsafe { &*self.slots.get() });
                self.lock.store(false, Ordering::Release);
                return Some(out);
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Create the pthread key. Idempotent.
    pub fn init(&self) -> bool {
        if self.key.load(Ordering::Acquire) != NO_KEY {
            return true;
        }
        let mut key: libc::pthread_key_t = 0;
        if unsafe { libc::pthread_key_create(&mut key, None) } != 0 {
            return false;
        }
        // Another thread may have won the race; keep theirs.
        if self
            .key
            .compare_exchange(NO_KEY, key as usize, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            unsafe { libc::pthread_key_delete(key) };
        }
        true
    }

    fn key(&self) -> Option<libc::pthread_key_t> {
        match self.key.load(Ordering::Acquire) {
            NO_KEY => None,
            key => Some(key as libc::pthread_key_t),
        }
    }

    /// Allocate a slot. Ids are handed out in creation order starting at 0.
    /// Returns `None` when the table is full.
    pub fn create(&self, parent: u32, detached: bool) -> Option<u32> {
        self.with_slots(|slots| {
            let id = self.next_id.load(Ordering::Relaxed);
            if id >= MAX_THREADS {
                return None;
            }
            self.next_id.store(id + 1, Ordering::Relaxed);
            slots[id] = Slot {
                used: true,
                record: ThreadRecord {
                    id: id as u32,
                    parent,
                    os_tid: 0,
                    detached,
                    started: false,
                    stack: StackBounds::default(),
                },
            };
            Some(id as u32)
        })
    }

    /// Bind `id` to a running OS thread and record its stack bounds.
    pub fn start(&self, id: u32, os_tid: i32, stack: Option<StackBounds>) {
        self.with_slots(|slots| {
            if let Some(slot) = slots.get_mut(id as usize).filter(|s| s.used) {
                slot.record.os_tid = os_tid;
                slot.record.started = true;
                slot.record.stack = stack.unwrap_or_default();
            }
        })
    }

    pub fn set_current(&self, id: u32) {
        let Some(key) = self.key() else { return };
        unsafe { libc::pthread_setspecific(key, encode_id(id)) };
    }

    pub fn current_id(&self) -> Option<u32> {
        let key = self.key()?;
        let raw = unsafe { libc::pthread_getspecific(key) } as usize;
        if raw == 0 {
            None
        } else {
            Some((raw - 1) as u32)
        }
    }

    pub fn get(&self, id: u32) -> Option<ThreadRecord> {
        self.with_slots(|slots| {
            slots
                .get(id as usize)
                .filter(|s| s.used)
                .map(|s| s.record)
        })
    }

    /// Record of the calling thread. Async-signal-safe: returns `None`
    /// rather than wait on a held lock.
    pub fn current(&self) -> Option<ThreadRecord> {
        let id = self.current_id()?;
        self.try_with_slots(|slots| {
            slots
                .get(id as usize)
                .filter(|s| s.used)
                .map(|s| s.record)
        })
        .flatten()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
