// =============================================================================
// unwind.rs: Stack Unwind Dispatcher
// =============================================================================
//
// Two strategies:
//   - fast: walk the frame-pointer chain from `bp`, bounded by the current
//     thread's stack
//   - precise: ask the platform unwinder (libgcc's `_Unwind_Backtrace`) for
//     the whole stack, then drop the frames above the requested pc
//
// Both run in signal context: no allocation, no locks. Results live in a
// fixed-capacity `StackTrace` on the caller's stack.
// =============================================================================

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::capabilities::Capabilities;

/// Deepest stack the runtime ever records.
pub const MAX_STACK_FRAMES: usize = 256;

const WORD: usize = std::mem::size_of::<usize>();

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Cached `sysconf(_SC_PAGESIZE)`. Any pc below this is treated as garbage.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Address range of one thread's stack. `bottom` is the lowest address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackBounds {
    pub bottom: usize,
    pub top: usize,
}

impl StackBounds {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom && addr < self.top
    }
}

/// `frame` can hold a saved frame pointer and return address inside the
/// stack, strictly above `bottom`.
#[inline]
pub fn is_valid_frame(frame: usize, top: usize, bottom: usize) -> bool {
    frame > bottom && frame < top.saturating_sub(2 * WORD)
}

/// Address of the instruction after the one at `pc`.
///
/// A signal's reported pc points at the faulting instruction, while frames
/// found by unwinding hold return addresses. Reports shift the signal pc so
/// that both are symbolized the same way.
#[inline]
pub fn next_instruction_pc(pc: usize) -> usize {
    if cfg!(any(target_arch = "mips", target_arch = "mips64", target_arch = "sparc64")) {
        pc + 8
    } else if cfg!(any(
        target_arch = "powerpc",
        target_arch = "powerpc64",
        target_arch = "arm",
        target_arch = "aarch64",
        target_arch = "loongarch64"
    )) {
        pc + 4
    } else if cfg!(target_arch = "riscv64") {
        pc + riscv_instruction_len(pc)
    } else {
        pc + 1
    }
}

/// Compressed instructions are two bytes; everything we can hit is four.
fn riscv_instruction_len(pc: usize) -> usize {
    if pc == 0 {
        return 4;
    }
    let low = unsafe { std::ptr::read_unaligned(pc as *const u16) };
    if low & 0x3 != 0x3 {
        2
    } else {
        4
    }
}

/// Fixed-capacity list of return addresses, innermost first.
#[derive(Clone, Copy)]
pub struct StackTrace {
    frames: [usize; MAX_STACK_FRAMES],
    len: usize,
}

impl StackTrace {
    pub const fn new() -> Self {
        Self {
            frames: [0; MAX_STACK_FRAMES],
            len: 0,
        }
    }

    /// Trace holding `pcs`, truncated to `MAX_STACK_FRAMES`.
    pub fn from_frames(pcs: &[usize]) -> Self {
        let mut trace = Self::new();
        for &pc in pcs {
            trace.push(pc);
        }
        trace
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.frames[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, pc: usize) {
        if self.len < MAX_STACK_FRAMES {
            self.frames[self.len] = pc;
            self.len += 1;
        }
    }

    /// Index of the frame closest to `pc`.
    pub fn locate_pc(&self, pc: usize) -> usize {
        let mut best = 0;
        for i in 1..self.len {
            if self.frames[i].abs_diff(pc) < self.frames[best].abs_diff(pc) {
                best = i;
            }
        }
        best
    }

    fn pop_front(&mut self, count: usize) {
        let count = count.min(self.len);
        self.frames.copy_within(count..self.len, 0);
        self.len -= count;
    }

    fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// `    #N 0xADDR` per frame, the format the symbolizer pipeline expects.
    pub fn write_frames(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for (i, pc) in self.as_slice().iter().enumerate() {
            writeln!(out, "    #{} 0x{:x}", i, pc)?;
        }
        Ok(())
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for pc in self.as_slice() {
            list.entry(&format_args!("0x{:x}", pc));
        }
        list.finish()
    }
}

/// Everything the dispatcher needs to pick and run an unwinder.
#[derive(Debug, Clone, Copy)]
pub struct UnwindRequest {
    pub pc: usize,
    pub bp: usize,
    /// Signal context, if unwinding on behalf of a signal handler.
    pub context: Option<NonNull<c_void>>,
    pub prefer_fast: bool,
    pub max_depth: usize,
}

/// Walk the frame-pointer chain.
///
/// # Safety
/// Every address in `[bounds.bottom, bounds.top)` must be readable. Real
/// thread stack bounds satisfy this; a zero `top` stops after the pc.
pub unsafe fn unwind_fast(
    pc: usize,
    bp: usize,
    bounds: StackBounds,
    max_depth: usize,
    out: &mut StackTrace,
) {
    out.len = 0;
    out.push(pc);
    if bounds.top < 4096 {
        return;
    }

    let page = page_size();
    let max_depth = max_depth.min(MAX_STACK_FRAMES);
    let mut frame = bp;
    // Lowest address the next frame may have; rises as we walk, so a frame
    // pointing at itself terminates.
    let mut bottom = bounds.bottom;
    while is_valid_frame(frame, bounds.top, bottom)
        && frame % WORD == 0
        && out.len < max_depth
    {
        let slots = frame as *const usize;
        let pc1 = std::ptr::read_volatile(slots.add(1));
        if pc1 < page {
            break;
        }
        if pc1 != pc {
            out.push(pc1);
        }
        bottom = frame;
        frame = std::ptr::read_volatile(slots);
    }
}

/// Precise unwind: `capture` fills raw return addresses starting at its own
/// caller; frames above `pc` are dropped and slot 0 becomes `pc`.
pub fn unwind_slow<F>(pc: usize, max_depth: usize, capture: F, out: &mut StackTrace)
where
    F: FnOnce(&mut [usize]) -> usize,
{
    let limit = (max_depth + 1).min(MAX_STACK_FRAMES);
    let captured = capture(&mut out.frames[..limit]);
    out.len = captured.min(limit);

    let mut to_pop = out.locate_pc(pc);
    // Slot 0 is always the unwinder itself unless it is all we got.
    if to_pop == 0 && out.len > 1 {
        to_pop = 1;
    }
    out.pop_front(to_pop);
    if out.is_empty() {
        out.push(pc);
    } else {
        out.frames[0] = pc;
    }
    out.truncate(max_depth);
}

/// Pick fast or precise unwinding for `req` and fill `out`.
///
/// `bounds` are the current thread's stack bounds when the registry knows
/// the thread. The fast path needs them: without bounds it falls back to
/// context-based unwinding. With frame-pointer validation an out-of-bounds
/// `bp` on the fast path yields an empty trace; the precise path never
/// looks at `bp`.
pub fn dispatch<F>(
    req: &UnwindRequest,
    bounds: Option<StackBounds>,
    caps: &Capabilities,
    capture: F,
    out: &mut StackTrace,
) where
    F: FnOnce(Option<NonNull<c_void>>, &mut [usize]) -> usize,
{
    out.len = 0;
    let fast = caps.will_use_fast_unwind(req.prefer_fast)
        && (bounds.is_some() || !caps.can_slow_unwind);
    let bounds = bounds.unwrap_or_default();

    if fast
        && caps.validates_frame_pointers
        && !is_valid_frame(req.bp, bounds.top, bounds.bottom)
    {
        return;
    }

    let max_depth = req.max_depth.min(MAX_STACK_FRAMES);
    match max_depth {
        0 => return,
        1 => {
            out.push(req.pc);
            return;
        }
        _ => {}
    }

    if fast {
        unsafe { unwind_fast(req.pc, req.bp, bounds, max_depth, out) };
    } else {
        let context = req.context;
        unwind_slow(req.pc, max_depth, |buf| capture(context, buf), out);
    }
}

// libgcc / libunwind Itanium ABI.
const URC_NO_REASON: libc::c_int = 0;
const URC_NORMAL_STOP: libc::c_int = 4;

type UnwindTraceFn = extern "C" fn(ctx: *mut c_void, arg: *mut c_void) -> libc::c_int;

extern "C" {
    fn _Unwind_Backtrace(trace: UnwindTraceFn, arg: *mut c_void) -> libc::c_int;
    fn _Unwind_GetIP(ctx: *mut c_void) -> usize;
}

struct CaptureState<'a> {
    frames: &'a mut [usize],
    len: usize,
}

extern "C" fn capture_frame(ctx: *mut c_void, arg: *mut c_void) -> libc::c_int {
    let state = unsafe { &mut *(arg as *mut CaptureState<'_>) };
    let pc = unsafe { _Unwind_GetIP(ctx) };
    if pc < page_size() {
        return URC_NORMAL_STOP;
    }
    state.frames[state.len] = pc;
    state.len += 1;
    if state.len == state.frames.len() {
        URC_NORMAL_STOP
    } else {
        URC_NO_REASON
    }
}

/// Fill `frames` with return addresses from the platform unwinder,
/// innermost first. The unwinder follows CFI through signal trampolines,
/// so this also works from inside a handler.
#[inline(never)]
pub fn capture_backtrace(frames: &mut [usize]) -> usize {
    if frames.is_empty() {
        return 0;
    }
    let mut state = CaptureState { frames, len: 0 };
    unsafe {
        _Unwind_Backtrace(capture_frame, &mut state as *mut CaptureState<'_> as *mut c_void);
    }
    state.len
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake stack: `words` is the memory, frames are laid out as
    /// [saved_bp, return_pc] pairs linked upward.
    struct FakeStack {
        words: Vec<usize>,
    }

    impl FakeStack {
        fn new(pcs: &[usize]) -> Self {
            // Two slots per frame plus headroom above the outermost frame.
            let mut words = vec![0usize; pcs.len() * 2 + 8];
            let base = words.as_ptr() as usize;
            for (i, pc) in pcs.iter().enumerate() {
                let slot = 2 + i * 2;
                let next = if i + 1 < pcs.len() {
                    base + (slot + 2) * WORD
                } else {
                    0
                };
                words[slot] = next;
                words[slot + 1] = *pc;
            }
            Self { words }
        }

        fn bounds(&self) -> StackBounds {
            let base = self.words.as_ptr() as usize;
            StackBounds {
                bottom: base,
                top: base + self.words.len() * WORD,
            }
        }

        fn first_frame(&self) -> usize {
            self.words.as_ptr() as usize + 2 * WORD
        }
    }

    fn caps(validates: bool) -> Capabilities {
        Capabilities {
            validates_frame_pointers: validates,
            can_fast_unwind: true,
            can_slow_unwind: true,
            ..Capabilities::host()
        }
    }

    #[test]
    fn test_is_valid_frame() {
        assert!(is_valid_frame(0x2000, 0x3000, 0x1000));
        assert!(!is_valid_frame(0x1000, 0x3000, 0x1000));
        assert!(!is_valid_frame(0x3000 - 2 * WORD, 0x3000, 0x1000));
        assert!(!is_valid_frame(0x10, 0, 0));
    }

    #[test]
    fn test_fast_unwind_walks_chain() {
        let stack = FakeStack::new(&[0x11000, 0x12000, 0x13000]);
        let mut trace = StackTrace::new();
        unsafe { unwind_fast(0x10000, stack.first_frame(), stack.bounds(), 16, &mut trace) };
        assert_eq!(trace.as_slice(), &[0x10000, 0x11000, 0x12000, 0x13000]);
    }

    #[test]
    fn test_fast_unwind_respects_max_depth() {
        let stack = FakeStack::new(&[0x11000, 0x12000, 0x13000]);
        let mut trace = StackTrace::new();
        unsafe { unwind_fast(0x10000, stack.first_frame(), stack.bounds(), 2, &mut trace) };
        assert_eq!(trace.as_slice(), &[0x10000, 0x11000]);
    }

    #[test]
    fn test_fast_unwind_skips_duplicate_pc_and_stops_on_low_pc() {
        let stack = FakeStack::new(&[0x10000, 0x12000, 0x10, 0x14000]);
        let mut trace = StackTrace::new();
        unsafe { unwind_fast(0x10000, stack.first_frame(), stack.bounds(), 16, &mut trace) };
        assert_eq!(trace.as_slice(), &[0x10000, 0x12000]);
    }

    #[test]
    fn test_fast_unwind_without_bounds_keeps_only_pc() {
        let mut trace = StackTrace::new();
        unsafe { unwind_fast(0x10000, 0xdead_0000, StackBounds::default(), 16, &mut trace) };
        assert_eq!(trace.as_slice(), &[0x10000]);
    }

    #[test]
    fn test_slow_unwind_pops_frames_above_pc() {
        let mut trace = StackTrace::new();
        unwind_slow(
            0x5001,
            8,
            |buf| {
                let raw = [0x9000, 0x9100, 0x5000, 0x6000, 0x7000];
                buf[..raw.len()].copy_from_slice(&raw);
                raw.len()
            },
            &mut trace,
        );
        assert_eq!(trace.as_slice(), &[0x5001, 0x6000, 0x7000]);
    }

    #[test]
    fn test_slow_unwind_always_drops_own_frame() {
        let mut trace = StackTrace::new();
        unwind_slow(
            0x100,
            8,
            |buf| {
                buf[..3].copy_from_slice(&[0x101, 0x9000, 0xa000]);
                3
            },
            &mut trace,
        );
        assert_eq!(trace.as_slice(), &[0x100, 0xa000]);
    }

    #[test]
    fn test_slow_unwind_with_nothing_captured_keeps_pc() {
        let mut trace = StackTrace::new();
        unwind_slow(0x4242, 8, |_| 0, &mut trace);
        assert_eq!(trace.as_slice(), &[0x4242]);
    }

    #[test]
    fn test_slow_unwind_truncates_to_max_depth() {
        let mut trace = StackTrace::new();
        unwind_slow(
            0x1000,
            2,
            |buf| {
                assert_eq!(buf.len(), 3);
                buf.copy_from_slice(&[0x1000, 0x2000, 0x3000]);
                3
            },
            &mut trace,
        );
        assert_eq!(trace.as_slice(), &[0x1000, 0x3000]);
    }

    #[test]
    fn test_dispatch_invalid_bp_on_validating_host_is_empty() {
        let stack = FakeStack::new(&[0x11000]);
        let req = UnwindRequest {
            pc: 0x10000,
            bp: stack.bounds().top + 0x1000,
            context: None,
            prefer_fast: true,
            max_depth: 16,
        };
        let mut trace = StackTrace::from_frames(&[0x1]);
        dispatch(
            &req,
            Some(stack.bounds()),
            &caps(true),
            |_, _| panic!("precise unwinder must not run"),
            &mut trace,
        );
        assert!(trace.is_empty());
    }

    #[test]
    fn test_dispatch_context_path_ignores_bp() {
        let mut ctx = 0u64;
        let req = UnwindRequest {
            pc: 0x5001,
            bp: 0xdead_beef,
            context: NonNull::new(&mut ctx as *mut u64 as *mut c_void),
            prefer_fast: false,
            max_depth: 16,
        };
        for validates in [false, true] {
            let mut seen_context = false;
            let mut trace = StackTrace::new();
            dispatch(
                &req,
                None,
                &caps(validates),
                |context, buf| {
                    seen_context = context.is_some();
                    buf[..3].copy_from_slice(&[0x9000, 0x5000, 0x6000]);
                    3
                },
                &mut trace,
            );
            assert!(seen_context, "validates={validates}");
            assert_eq!(trace.as_slice(), &[0x5001, 0x6000], "validates={validates}");
        }
    }

    #[test]
    fn test_dispatch_context_path_ignores_out_of_bounds_bp() {
        let stack = FakeStack::new(&[0x11000]);
        let req = UnwindRequest {
            pc: 0x5001,
            bp: stack.bounds().top + 0x1000,
            context: None,
            prefer_fast: false,
            max_depth: 16,
        };
        let mut trace = StackTrace::new();
        dispatch(
            &req,
            Some(stack.bounds()),
            &caps(true),
            |_, buf| {
                buf[..3].copy_from_slice(&[0x9000, 0x5000, 0x6000]);
                3
            },
            &mut trace,
        );
        assert_eq!(trace.as_slice(), &[0x5001, 0x6000]);
    }

    #[test]
    fn test_dispatch_unknown_thread_falls_back_to_context() {
        let req = UnwindRequest {
            pc: 0x5001,
            bp: 0xdead_beef,
            context: None,
            prefer_fast: true,
            max_depth: 16,
        };
        for validates in [false, true] {
            let mut captured = false;
            let mut trace = StackTrace::new();
            dispatch(
                &req,
                None,
                &caps(validates),
                |_, buf| {
                    captured = true;
                    buf[..4].copy_from_slice(&[0x9000, 0x5000, 0x6000, 0x7000]);
                    4
                },
                &mut trace,
            );
            assert!(captured, "validates={validates}");
            assert_eq!(trace.as_slice(), &[0x5001, 0x6000, 0x7000]);
        }
    }

    #[test]
    fn test_dispatch_without_precise_unwinder_keeps_pc() {
        let req = UnwindRequest {
            pc: 0x10000,
            bp: 0xdead_0000,
            context: None,
            prefer_fast: false,
            max_depth: 16,
        };
        let only_fast = Capabilities {
            can_slow_unwind: false,
            ..caps(false)
        };
        let mut trace = StackTrace::new();
        dispatch(&req, None, &only_fast, |_, _| panic!("no precise unwinder"), &mut trace);
        assert_eq!(trace.as_slice(), &[0x10000]);
    }

    #[test]
    fn test_dispatch_fast_path_uses_bounds() {
        let stack = FakeStack::new(&[0x11000, 0x12000]);
        let req = UnwindRequest {
            pc: 0x10000,
            bp: stack.first_frame(),
            context: None,
            prefer_fast: true,
            max_depth: 16,
        };
        let mut trace = StackTrace::new();
        dispatch(&req, Some(stack.bounds()), &caps(true), |_, _| 0, &mut trace);
        assert_eq!(trace.as_slice(), &[0x10000, 0x11000, 0x12000]);
    }

    #[test]
    fn test_dispatch_small_depths() {
        let mut req = UnwindRequest {
            pc: 0x10000,
            bp: 0,
            context: None,
            prefer_fast: true,
            max_depth: 0,
        };
        let mut trace = StackTrace::from_frames(&[0x1, 0x2]);
        dispatch(&req, None, &caps(false), |_, _| 0, &mut trace);
        assert!(trace.is_empty());
        req.max_depth = 1;
        dispatch(&req, None, &caps(false), |_, _| 0, &mut trace);
        assert_eq!(trace.as_slice(), &[0x10000]);
    }

    #[test]
    fn test_capture_backtrace_sees_real_frames() {
        let mut frames = [0usize; 32];
        let n = capture_backtrace(&mut frames);
        assert!(n > 1);
        assert!(frames[..n].iter().all(|&pc| pc >= page_size()));
    }

    #[test]
    fn test_write_frames_format() {
        let mut trace = StackTrace::new();
        trace.push(0x1234);
        trace.push(0xabcd);
        let mut out = String::new();
        trace.write_frames(&mut out).unwrap();
        assert_eq!(out, "    #0 0x1234\n    #1 0xabcd\n");
    }
}
