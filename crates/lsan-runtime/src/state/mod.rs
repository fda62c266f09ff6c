// =============================================================================
// state/mod.rs: Lifecycle context
// =============================================================================
//
// `Runtime<C>` owns everything the lifecycle protocol mutates:
//   - the initialization state machine (NotStarted → InProgress → Completed)
//   - the published flag snapshot
//   - the exit-registration token and the once-only leak check
//
// Cold-path bring-up lives in state/init.rs. Everything reachable from a
// signal handler here is lock-free and allocation-free.
// =============================================================================

mod init;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use lsan_config::{Flags, TOOL_NAME};
use once_cell::sync::OnceCell;

use crate::capabilities::Capabilities;
use crate::collab::{BinaryName, Collaborators, ExitHook, FatalReport, SignalInfo};
use crate::unwind::{self, StackTrace, UnwindRequest, MAX_STACK_FRAMES};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    NotStarted = 0,
    InProgress = 1,
    Completed = 2,
}

impl InitState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotStarted,
            1 => Self::InProgress,
            _ => Self::Completed,
        }
    }
}

/// No thread owns initialization.
const NO_OWNER: i32 = 0;

pub struct Runtime<C: Collaborators> {
    state: AtomicU8,
    /// Kernel tid of the thread running bring-up.
    owner: AtomicI32,
    flags: OnceCell<Flags>,
    binary_name: OnceCell<BinaryName>,
    exit_registered: AtomicBool,
    leak_check_done: AtomicBool,
    capabilities: Capabilities,
    exit_hook: ExitHook,
    collab: C,
}

impl<C: Collaborators> Runtime<C> {
    /// `exit_hook` must route back to this instance's `run_exit_check`.
    pub const fn new(collab: C, capabilities: Capabilities, exit_hook: ExitHook) -> Self {
        Self {
            state: AtomicU8::new(InitState::NotStarted as u8),
            owner: AtomicI32::new(NO_OWNER),
            flags: OnceCell::new(),
            binary_name: OnceCell::new(),
            exit_registered: AtomicBool::new(false),
            leak_check_done: AtomicBool::new(false),
            capabilities,
            exit_hook,
            collab,
        }
    }

    pub fn state(&self) -> InitState {
        InitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == InitState::Completed
    }

    /// Resolved flags; `None` until the resolver step has run.
    #[inline]
    pub fn flags(&self) -> Option<&Flags> {
        self.flags.get()
    }

    pub fn collaborators(&self) -> &C {
        &self.collab
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn tool_name(&self) -> &'static str {
        TOOL_NAME
    }

    pub fn binary_name(&self) -> &str {
        self.binary_name.get().map(|n| n.as_str()).unwrap_or("")
    }

    pub fn exit_registered(&self) -> bool {
        self.exit_registered.load(Ordering::Acquire)
    }

    /// Unwind into `out` with the current thread's stack bounds.
    pub fn unwind(&self, req: &UnwindRequest, out: &mut StackTrace) {
        let bounds = self.collab.current_thread().map(|t| t.stack);
        unwind::dispatch(
            req,
            bounds,
            &self.capabilities,
            |context, frames| self.collab.capture_backtrace(context, frames),
            out,
        );
    }

    /// Print the stack of the caller, starting at `pc`.
    pub fn print_stack_trace(&self, pc: usize, bp: usize) {
        let prefer_fast = self
            .flags()
            .map(|f| f.common.fast_unwind_on_fatal)
            .unwrap_or(false);
        let mut stack = StackTrace::new();
        self.unwind(
            &UnwindRequest {
                pc,
                bp,
                context: None,
                prefer_fast,
                max_depth: MAX_STACK_FRAMES,
            },
            &mut stack,
        );
        self.collab.report_text(&|out| {
            stack.write_frames(out)?;
            out.write_str("\n")
        });
    }

    /// Deadly-signal path: unwind from the signal's machine state, hand
    /// the report over, then terminate with `exitcode`.
    pub fn on_deadly_signal(&self, info: &SignalInfo) -> ! {
        let common = self.flags().map(|f| f.common).unwrap_or_default();
        let mut stack = StackTrace::new();
        self.unwind(
            &UnwindRequest {
                pc: unwind::next_instruction_pc(info.pc),
                bp: info.bp,
                context: info.context,
                prefer_fast: common.fast_unwind_on_fatal,
                max_depth: MAX_STACK_FRAMES,
            },
            &mut stack,
        );
        self.collab.handle_fatal_signal(&FatalReport {
            signal: info,
            stack: &stack,
            thread: self.collab.current_thread(),
        });
        self.collab.exit(common.exitcode)
    }

    /// Normal-exit hook body. Runs the scan at most once, and only when
    /// detection is on; leaks found turn into `exitcode`.
    pub fn run_exit_check(&self) {
        let Some(flags) = self.flags() else { return };
        if !flags.wants_exit_check() {
            return;
        }
        self.leak_check_once(flags);
    }

    /// Explicit check. Shares the once-only guard with the exit hook, so a
    /// program that checks early does not get a second report at exit.
    pub fn do_leak_check(&self) {
        let Some(flags) = self.flags() else { return };
        if !flags.common.detect_leaks {
            return;
        }
        self.leak_check_once(flags);
    }

    /// Repeatable check that never terminates the process. Returns the
    /// number of leaks found.
    pub fn do_recoverable_leak_check(&self) -> usize {
        match self.flags() {
            Some(flags) if flags.common.detect_leaks => self.collab.run_leak_check(),
            _ => 0,
        }
    }

    fn leak_check_once(&self, flags: &Flags) {
        if self.leak_check_done.swap(true, Ordering::AcqRel) {
            return;
        }
        let leaks = self.collab.run_leak_check();
        rt_vreport!(1, "{}: leak check found {} leak(s)", TOOL_NAME, leaks);
        if leaks > 0 && flags.common.exitcode != 0 {
            self.collab.exit(flags.common.exitcode);
        }
    }

    pub(crate) fn exit_hook(&self) -> ExitHook {
        self.exit_hook
    }
}
