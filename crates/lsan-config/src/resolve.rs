//! Configuration resolution.
//!
//! Precedence, lowest first: built-in defaults, tool overrides, the embedded
//! default-options string, then `LSAN_OPTIONS`. Each source is parsed on its
//! own; a malformed token ends that source only.

use std::fmt;

use crate::env::{EnvSource, OPTIONS_ENV, SYMBOLIZER_ENV};
use crate::error::ParseError;
use crate::flags::{FlagInfo, Flags, TOOL_NAME};
use crate::parser::{FlagParser, UnknownFlags};

/// Where an option string came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSource {
    /// String compiled into the instrumented binary.
    DefaultOptions,
    /// `LSAN_OPTIONS`.
    Environment,
}

impl fmt::Display for OptionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionSource::DefaultOptions => f.write_str("default options"),
            OptionSource::Environment => f.write_str("LSAN_OPTIONS"),
        }
    }
}

/// A source that stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostic {
    pub source: OptionSource,
    pub error: ParseError,
}

/// Raw inputs to resolution, borrowed from wherever they live.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionSources<'a> {
    pub symbolizer_path: Option<&'a str>,
    pub default_options: Option<&'a str>,
    pub env_options: Option<&'a str>,
}

impl<'a> OptionSources<'a> {
    /// Collect sources from `env`. The symbolizer path is only read when
    /// the platform can call `getenv` this early without allocating.
    pub fn from_env<E: EnvSource>(
        env: &'a E,
        safe_early_env: bool,
        default_options: Option<&'a str>,
    ) -> Self {
        Self {
            symbolizer_path: if safe_early_env {
                env.var(SYMBOLIZER_ENV)
            } else {
                None
            },
            default_options,
            env_options: env.var(OPTIONS_ENV),
        }
    }
}

/// The resolved snapshot plus everything worth reporting about it.
#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    pub flags: Flags,
    pub unknown: UnknownFlags,
    diagnostics: [Option<Diagnostic>; 2],
}

impl Resolution {
    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().flatten()
    }

    /// Unknown keys or parse failures were seen.
    pub fn has_problems(&self) -> bool {
        !self.unknown.is_empty() || self.diagnostics().next().is_some()
    }

    /// Write one line per source that stopped early.
    pub fn write_diagnostics(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for diag in self.diagnostics() {
            writeln!(
                out,
                "{}: failed to parse {}: {}",
                TOOL_NAME, diag.source, diag.error
            )?;
        }
        Ok(())
    }

    /// Write the unrecognized-flag list, if any.
    pub fn write_unknown(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        if !self.unknown.is_empty() {
            writeln!(
                out,
                "WARNING: found {} unrecognized flag(s):",
                self.unknown.len() + self.unknown.dropped()
            )?;
            for name in self.unknown.iter() {
                writeln!(out, "    {}", name)?;
            }
            if self.unknown.dropped() > 0 {
                writeln!(out, "    ... and {} more", self.unknown.dropped())?;
            }
        }
        Ok(())
    }

    /// Parse failures followed by unknown flags.
    pub fn write_warnings(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.write_diagnostics(out)?;
        self.write_unknown(out)
    }

    /// Write every flag with its resolved value and description.
    pub fn write_help(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "Available flags for {}:", TOOL_NAME)?;
        let mut result = Ok(());
        self.flags.for_each(|info| {
            if result.is_ok() {
                result = write_flag_line(out, &info);
            }
        });
        result
    }
}

fn write_flag_line(out: &mut dyn fmt::Write, info: &FlagInfo<'_>) -> fmt::Result {
    write!(out, "\t{}=", info.name)?;
    info.value.write_value(out)?;
    writeln!(out, "\n\t\t- {}", info.description)
}

/// Build the configuration snapshot. Never allocates and never fails.
pub fn resolve(sources: &OptionSources<'_>) -> Resolution {
    let mut flags = Flags::default();
    flags.apply_tool_overrides(sources.symbolizer_path);

    let mut unknown = UnknownFlags::default();
    let mut diagnostics = [None; 2];
    let mut parser = FlagParser::new(&mut flags, &mut unknown);

    let ordered = [
        (OptionSource::DefaultOptions, sources.default_options),
        (OptionSource::Environment, sources.env_options),
    ];
    for (slot, (source, text)) in ordered.into_iter().enumerate() {
        let Some(text) = text else { continue };
        if let Err(error) = parser.parse_str(text) {
            diagnostics[slot] = Some(Diagnostic { source, error });
        }
    }

    Resolution {
        flags,
        unknown,
        diagnostics,
    }
}
