// =============================================================================
// state/init.rs: Cold-path bring-up
// =============================================================================
//
// Everything here runs once per process, before user code, usually from the
// load-time constructor. Ordering is load-bearing: flags come first because
// every later step reads them, the thread registry must exist before the
// bootstrap thread is recorded, and the exit hook goes last so a scan never
// sees a half-built runtime.
// =============================================================================

use std::sync::atomic::Ordering;

use lsan_config::{resolve, Flags, OptionSources, TOOL_NAME};

use super::{InitState, Runtime, NO_OWNER};
use crate::collab::{BinaryName, Collaborators, BOOTSTRAP_THREAD_ID};

impl<C: Collaborators> Runtime<C> {
    /// Idempotent entry point.
    ///
    /// The first caller runs the bring-up; later callers return at once.
    /// A call from inside the bring-up on the same thread is fatal. A
    /// second thread arriving mid-bring-up waits for it to finish.
    pub fn initialize(&self) {
        let tid = self.collab.current_os_tid();
        match self.state.compare_exchange(
            InitState::NotStarted as u8,
            InitState::InProgress as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.owner.store(tid, Ordering::Release);
                self.bring_up();
                self.owner.store(NO_OWNER, Ordering::Release);
                self.state
                    .store(InitState::Completed as u8, Ordering::Release);
            }
            Err(s) if s == InitState::Completed as u8 => {}
            Err(_) => self.wait_for_owner(tid),
        }
    }

    #[inline(never)]
    fn wait_for_owner(&self, tid: i32) {
        loop {
            if self.state() == InitState::Completed {
                return;
            }
            if self.owner.load(Ordering::Acquire) == tid {
                self.collab.die(
                    "LeakSanitizer: CHECK failed: initialization re-entered from its own call stack",
                );
            }
            std::hint::spin_loop();
            unsafe { libc::sched_yield() };
        }
    }

    #[inline(never)]
    fn bring_up(&self) {
        let caps = self.capabilities;

        // 1. Identity
        let mut name = BinaryName::new();
        self.collab.binary_name(&mut name);
        let _ = self.binary_name.set(name);

        // 2. Host workaround
        if caps.needs_startup_workaround {
            self.collab.apply_startup_workaround();
        }

        // 3. Flags
        let flags = self.resolve_flags();

        // 4-8. Dependent subsystems
        self.collab.init_leak_detector();
        self.collab.init_allocator();
        if caps.can_replace_malloc {
            self.collab.install_allocation_interceptors();
        }
        self.collab.init_tls_layout();
        self.collab.install_interceptors();
        self.collab.init_thread_registry();

        // 9. Deadly-signal bridge
        if caps.has_signals {
            self.collab.install_signal_bridge(&flags.common);
        }

        // 10. Bootstrap thread
        let os_tid = self.collab.current_os_tid();
        let id = self.collab.create_thread(BOOTSTRAP_THREAD_ID, true);
        if id != BOOTSTRAP_THREAD_ID {
            self.collab.die(
                "LeakSanitizer: CHECK failed: bootstrap thread was not assigned registry id 0",
            );
        }
        self.collab.start_thread(id, os_tid);
        self.collab.set_current_thread(id);

        // 11. Exit-time scan
        if flags.wants_exit_check() {
            self.register_exit_check();
        }

        // 12. Coverage
        self.collab
            .init_coverage(flags.common.coverage, flags.common.coverage_dir.as_str());

        rt_vreport!(
            1,
            "{} initialized for '{}' (exit check {})",
            TOOL_NAME,
            self.binary_name(),
            if self.exit_registered() { "armed" } else { "off" }
        );
    }

    /// Resolve, publish reporting settings, print warnings/help, then
    /// publish the snapshot.
    fn resolve_flags(&self) -> &Flags {
        let sources = OptionSources::from_env(
            self.collab.env(),
            self.capabilities.safe_early_env,
            self.collab.default_options(),
        );
        let resolution = resolve(&sources);
        self.collab.configure_reporting(&resolution.flags.common);

        if resolution.diagnostics().next().is_some() {
            self.collab
                .report_text(&|out| resolution.write_diagnostics(out));
        }
        if resolution.flags.common.verbosity != 0 && !resolution.unknown.is_empty() {
            self.collab.report_text(&|out| resolution.write_unknown(out));
        }
        if resolution.flags.common.help {
            self.collab.report_text(&|out| resolution.write_help(out));
        }

        self.flags.get_or_init(|| resolution.flags)
    }

    fn register_exit_check(&self) {
        if self.exit_registered.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.collab.register_at_exit(self.exit_hook()) {
            self.exit_registered.store(false, Ordering::Release);
            rt_report!("WARNING: {}: could not register the exit-time leak check", TOOL_NAME);
        }
    }
}
