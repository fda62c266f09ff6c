//! Typed flag model.
//!
//! Two flag groups exist: the common diagnostic flags shared by every
//! sanitizer-style runtime, and the leak-detector specific flags. Both are
//! plain `Copy` structs so a resolved snapshot can be built on the stack and
//! published once.

use std::fmt;

use serde::Serialize;

use crate::error::{ParseError, Token};
use crate::fixed::FixedString;

/// Inline storage for path-like flag values.
pub type FlagPath = FixedString<512>;

/// Name of the tool, used as the report prefix.
pub const TOOL_NAME: &str = "LeakSanitizer";

/// Exit code used when the exit-time scan finds leaks.
pub const LEAK_EXIT_CODE: i32 = 23;

/// Allocation-context stack depth forced by the tool.
pub const TOOL_MALLOC_CONTEXT_SIZE: i32 = 30;

/// A value that can be parsed from an option string and rendered back.
pub trait FlagValue {
    /// Type name used in diagnostics.
    const KIND: &'static str;

    fn parse_flag(&mut self, name: &str, value: &str) -> Result<(), ParseError>;

    fn write_value(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

impl FlagValue for bool {
    const KIND: &'static str = "bool";

    fn parse_flag(&mut self, name: &str, value: &str) -> Result<(), ParseError> {
        *self = match value {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => return Err(invalid_value::<Self>(name, value)),
        };
        Ok(())
    }

    fn write_value(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        out.write_str(if *self { "true" } else { "false" })
    }
}

impl FlagValue for i32 {
    const KIND: &'static str = "int";

    fn parse_flag(&mut self, name: &str, value: &str) -> Result<(), ParseError> {
        *self = value
            .parse::<i32>()
            .map_err(|_| invalid_value::<Self>(name, value))?;
        Ok(())
    }

    fn write_value(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", self)
    }
}

impl<const N: usize> FlagValue for FixedString<N> {
    const KIND: &'static str = "string";

    fn parse_flag(&mut self, name: &str, value: &str) -> Result<(), ParseError> {
        if self.try_set(value) {
            Ok(())
        } else {
            Err(ParseError::ValueTooLong {
                name: Token::with(name),
                capacity: N,
            })
        }
    }

    fn write_value(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        out.write_str(self.as_str())
    }
}

fn invalid_value<T: FlagValue>(name: &str, value: &str) -> ParseError {
    ParseError::InvalidValue {
        name: Token::with(name),
        value: Token::with(value),
        expected: T::KIND,
    }
}

/// One row of the flag table, handed out by `Flags::for_each`.
pub struct FlagInfo<'a> {
    pub name: &'static str,
    pub description: &'static str,
    pub value: &'a dyn FlagDisplay,
}

/// Object-safe view of `FlagValue` for table walks.
pub trait FlagDisplay {
    fn write_value(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

impl<T: FlagValue> FlagDisplay for T {
    fn write_value(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        FlagValue::write_value(self, out)
    }
}

macro_rules! flag_group {
    (
        $(#[$meta:meta])*
        pub struct $group:ident {
            $(
                #[doc = $doc:literal]
                $field:ident : $ty:ty = $default:expr,
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Serialize)]
        pub struct $group {
            $(
                #[doc = $doc]
                pub $field: $ty,
            )*
        }

        impl Default for $group {
            fn default() -> Self {
                Self {
                    $( $field: $default, )*
                }
            }
        }

        impl $group {
            /// Every option name this group recognizes.
            pub const NAMES: &'static [&'static str] = &[$( stringify!($field) ),*];

            /// Apply `name=value`. Returns `None` when `name` is not part of
            /// this group.
            pub fn set(&mut self, name: &str, value: &str) -> Option<Result<(), ParseError>> {
                match name {
                    $( stringify!($field) => Some(self.$field.parse_flag(name, value)), )*
                    _ => None,
                }
            }

            pub fn for_each(&self, f: &mut dyn FnMut(FlagInfo<'_>)) {
                $(
                    f(FlagInfo {
                        name: stringify!($field),
                        description: $doc.trim(),
                        value: &self.$field,
                    });
                )*
            }
        }
    };
}

flag_group! {
    /// Diagnostic flags shared with the rest of the sanitizer family.
    pub struct CommonFlags {
        /// Verbosity level (0 - silent, 1 - a bit of output, 2+ - more output).
        verbosity: i32 = 0,
        /// Print the flag descriptions after resolution.
        help: bool = false,
        /// Write reports to "stderr", "stdout" or to "<log_path>.<pid>".
        log_path: FlagPath = FlagPath::with("stderr"),
        /// Path to the external symbolizer; empty means none.
        external_symbolizer_path: FlagPath = FlagPath::new(),
        /// Max number of stack frames kept for each allocation.
        malloc_context_size: i32 = 1,
        /// Enable memory leak detection.
        detect_leaks: bool = true,
        /// Invoke leak checking in an atexit handler.
        leak_check_at_exit: bool = true,
        /// Override the program exit status if the tool found an error.
        exitcode: i32 = 1,
        /// Intercept __tls_get_addr.
        intercept_tls_get_addr: bool = false,
        /// Use the frame-pointer unwinder for fatal error reports.
        fast_unwind_on_fatal: bool = false,
        /// Use the frame-pointer unwinder for allocation stacks.
        fast_unwind_on_malloc: bool = true,
        /// Handle SIGSEGV.
        handle_segv: bool = true,
        /// Handle SIGBUS.
        handle_sigbus: bool = true,
        /// Handle SIGABRT.
        handle_abort: bool = false,
        /// Handle SIGILL.
        handle_sigill: bool = false,
        /// Handle SIGFPE.
        handle_sigfpe: bool = true,
        /// Run fatal-signal handlers on an alternate signal stack.
        use_sigaltstack: bool = true,
        /// Enable coverage collection.
        coverage: bool = false,
        /// Target directory for coverage dumps.
        coverage_dir: FlagPath = FlagPath::with("."),
    }
}

flag_group! {
    /// Leak-detector specific flags, consumed by the external scanner.
    pub struct LsanFlags {
        /// Print addresses of leaked objects after main leak report.
        report_objects: bool = false,
        /// Aggregate two objects into one leak if this many stack frames match.
        resolution: i32 = 0,
        /// The number of leaks reported, 0 means unlimited.
        max_leaks: i32 = 0,
        /// Root set: include global variables.
        use_globals: bool = true,
        /// Root set: include thread stacks.
        use_stacks: bool = true,
        /// Root set: include thread registers.
        use_registers: bool = true,
        /// Root set: include TLS and thread-specific storage.
        use_tls: bool = true,
        /// Root set: include regions added via __lsan_register_root_region().
        use_root_regions: bool = true,
        /// Root set: mark as reachable all allocations made from dynamic linker.
        use_ld_allocations: bool = true,
        /// Consider unaligned pointers valid.
        use_unaligned: bool = false,
        /// Consider pointers found in poisoned memory to be valid.
        use_poisoned: bool = false,
        /// Debug logging for pointers.
        log_pointers: bool = false,
        /// Debug logging for threads.
        log_threads: bool = false,
        /// Number of leak-check tries before reporting.
        tries: i32 = 1,
        /// Suppressions file name.
        suppressions: FlagPath = FlagPath::new(),
    }
}

/// The complete resolved flag set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct Flags {
    pub common: CommonFlags,
    pub lsan: LsanFlags,
}

impl Flags {
    /// Apply the values the tool forces on top of the common defaults.
    ///
    /// These replace the defaults, not explicit user options: the option
    /// strings are parsed afterwards and still win.
    pub fn apply_tool_overrides(&mut self, symbolizer_path: Option<&str>) {
        if let Some(path) = symbolizer_path {
            self.common.external_symbolizer_path.set(path);
        }
        self.common.malloc_context_size = TOOL_MALLOC_CONTEXT_SIZE;
        self.common.intercept_tls_get_addr = true;
        self.common.detect_leaks = true;
        self.common.exitcode = LEAK_EXIT_CODE;
    }

    /// Apply one `name=value` pair. `None` means the name is unknown.
    pub fn set(&mut self, name: &str, value: &str) -> Option<Result<(), ParseError>> {
        self.common
            .set(name, value)
            .or_else(|| self.lsan.set(name, value))
    }

    pub fn is_known(name: &str) -> bool {
        CommonFlags::NAMES.contains(&name) || LsanFlags::NAMES.contains(&name)
    }

    /// Walk every flag in declaration order, common flags first.
    pub fn for_each(&self, mut f: impl FnMut(FlagInfo<'_>)) {
        self.common.for_each(&mut f);
        self.lsan.for_each(&mut f);
    }

    /// Both the master toggle and the at-exit toggle are on.
    pub fn wants_exit_check(&self) -> bool {
        self.common.detect_leaks && self.common.leak_check_at_exit
    }

    /// Render the snapshot as TOML for operator tooling.
    pub fn to_toml(&self) -> Result<String, crate::ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
