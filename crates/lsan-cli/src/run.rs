//! `lsan run`: spawn a command with the runtime preloaded.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use anyhow::{Context, Result};
use clap::Args;
use lsan_config::{log_cli_debug, log_cli_info, resolve, OptionSources};
use nix::sys::signal::Signal;

const RUNTIME_LIB: &str = "liblsan_runtime.so";

#[derive(Args)]
pub struct RunArgs {
    /// Runtime library to preload (searched for when omitted)
    #[arg(long, value_name = "PATH")]
    lib: Option<PathBuf>,

    /// Options appended to LSAN_OPTIONS for the child
    #[arg(long)]
    options: Option<String>,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn find_runtime_library() -> Result<PathBuf> {
    let candidates = [
        // Development: next to this binary in the cargo target dir
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.join(RUNTIME_LIB))),
        Some(PathBuf::from("target/release").join(RUNTIME_LIB)),
        Some(PathBuf::from("target/debug").join(RUNTIME_LIB)),
        // Installed location
        Some(PathBuf::from("/usr/local/lib/lsan").join(RUNTIME_LIB)),
    ];

    for candidate in candidates.into_iter().flatten() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    anyhow::bail!(
        "Could not find {RUNTIME_LIB}.\n\
        Build with: cargo build -p lsan-runtime --features preload --release\n\
        or pass --lib PATH"
    );
}

/// `existing` followed by `extra`; later options win inside the runtime.
pub fn merge_options(existing: Option<&str>, extra: Option<&str>) -> Option<String> {
    match (existing.filter(|s| !s.is_empty()), extra.filter(|s| !s.is_empty())) {
        (Some(a), Some(b)) => Some(format!("{a}:{b}")),
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (None, None) => None,
    }
}

/// Put `lib` first so it wins symbol interposition.
pub fn merge_preload(lib: &Path, existing: Option<&str>) -> String {
    match existing.filter(|s| !s.trim().is_empty()) {
        Some(rest) => format!("{}:{}", lib.display(), rest),
        None => lib.display().to_string(),
    }
}

/// Exit status to propagate, reporting leaks and fatal signals on stderr.
pub fn describe_exit(status: ExitStatus, leak_exitcode: i32) -> i32 {
    if let Some(sig) = status.signal() {
        let name = Signal::try_from(sig)
            .map(|s| s.as_str())
            .unwrap_or("unknown signal");
        eprintln!("lsan: target terminated by {}", name);
        return 128 + sig;
    }
    let code = status.code().unwrap_or(1);
    if code != 0 && code == leak_exitcode {
        eprintln!("lsan: leaks detected (exit code {})", code);
    }
    code
}

pub fn cmd_run(args: RunArgs) -> Result<i32> {
    let lib = match args.lib {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Runtime library not found: {}", path.display());
            }
            path
        }
        None => find_runtime_library()?,
    };
    let lib = lib
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", lib.display()))?;

    let options = merge_options(
        std::env::var("LSAN_OPTIONS").ok().as_deref(),
        args.options.as_deref(),
    );
    let leak_exitcode = resolve(&OptionSources {
        env_options: options.as_deref(),
        ..OptionSources::default()
    })
    .flags
    .common
    .exitcode;
    let preload = merge_preload(&lib, std::env::var("LD_PRELOAD").ok().as_deref());

    log_cli_info!(
        "Spawning target",
        command = args.command[0].as_str(),
        lib = tracing::field::display(lib.display())
    );
    log_cli_debug!("Child environment", ld_preload = preload.as_str());

    let mut cmd = Command::new(&args.command[0]);
    cmd.args(&args.command[1..]);
    cmd.env("LD_PRELOAD", &preload);
    if let Some(options) = &options {
        cmd.env("LSAN_OPTIONS", options);
    }

    let status = cmd
        .status()
        .with_context(|| format!("Failed to execute: {}", args.command[0]))?;
    Ok(describe_exit(status, leak_exitcode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_options() {
        assert_eq!(merge_options(None, None), None);
        assert_eq!(merge_options(Some(""), Some("a=1")).as_deref(), Some("a=1"));
        assert_eq!(merge_options(Some("a=1"), None).as_deref(), Some("a=1"));
        assert_eq!(
            merge_options(Some("a=1"), Some("b=2")).as_deref(),
            Some("a=1:b=2")
        );
    }

    #[test]
    fn test_merge_preload_puts_runtime_first() {
        let lib = Path::new("/opt/lsan/liblsan_runtime.so");
        assert_eq!(merge_preload(lib, None), "/opt/lsan/liblsan_runtime.so");
        assert_eq!(
            merge_preload(lib, Some("/usr/lib/libfoo.so")),
            "/opt/lsan/liblsan_runtime.so:/usr/lib/libfoo.so"
        );
    }

    #[test]
    fn test_describe_exit_codes() {
        assert_eq!(describe_exit(ExitStatus::from_raw(0), 23), 0);
        assert_eq!(describe_exit(ExitStatus::from_raw(3 << 8), 23), 3);
        assert_eq!(describe_exit(ExitStatus::from_raw(23 << 8), 23), 23);
        assert_eq!(describe_exit(ExitStatus::from_raw(libc::SIGSEGV), 23), 128 + libc::SIGSEGV);
    }
}
