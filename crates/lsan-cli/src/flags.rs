//! `lsan flags` and `lsan check`.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use lsan_config::{
    log_cli_debug, log_cli_warn, resolve, FlagInfo, Flags, OptionSources, Resolution,
};

#[derive(Args)]
pub struct FlagsArgs {
    /// Options string parsed as LSAN_OPTIONS
    #[arg(long, env = "LSAN_OPTIONS")]
    options: Option<String>,

    /// Options string parsed as the binary's embedded defaults
    #[arg(long)]
    default_options: Option<String>,

    /// External symbolizer path
    #[arg(long, env = "LSAN_SYMBOLIZER_PATH")]
    symbolizer_path: Option<String>,

    /// Print JSON instead of TOML
    #[arg(long)]
    json: bool,

    /// Write the snapshot to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

/// Unknown keys and parse failures, one per line. Empty when clean.
pub fn problems_text(resolution: &Resolution) -> String {
    let mut out = String::new();
    let _ = resolution.write_diagnostics(&mut out);
    let _ = resolution.write_unknown(&mut out);
    out
}

fn render(resolution: &Resolution, json: bool) -> Result<String> {
    if json {
        let mut s = serde_json::to_string_pretty(&resolution.flags)?;
        s.push('\n');
        Ok(s)
    } else {
        Ok(resolution.flags.to_toml()?)
    }
}

pub fn cmd_flags(args: FlagsArgs) -> Result<()> {
    let sources = OptionSources {
        symbolizer_path: args.symbolizer_path.as_deref(),
        default_options: args.default_options.as_deref(),
        env_options: args.options.as_deref(),
    };
    let resolution = resolve(&sources);
    if resolution.has_problems() {
        log_cli_warn!("Options did not resolve cleanly");
        eprint!("{}", problems_text(&resolution));
    }

    match args.output {
        Some(path) if !args.json => {
            resolution
                .flags
                .write_toml(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        Some(path) => {
            std::fs::write(&path, render(&resolution, true)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{}", render(&resolution, args.json)?),
    }
    Ok(())
}

/// Returns false when `options` has unknown keys or does not parse.
pub fn cmd_check(options: &str) -> Result<bool> {
    let resolution = resolve(&OptionSources {
        env_options: Some(options),
        ..OptionSources::default()
    });
    log_cli_debug!("Checked options", length = options.len());

    if resolution.has_problems() {
        eprint!("{}", problems_text(&resolution));
        return Ok(false);
    }

    let mut summary = String::new();
    let defaults = resolve(&OptionSources::default()).flags;
    let changed = changed_flags(&defaults, &resolution.flags);
    write!(summary, "OK: {} flag(s) differ from defaults", changed.len())?;
    for name in changed {
        write!(summary, "\n    {}", name)?;
    }
    println!("{}", summary);
    Ok(true)
}

/// Names of flags whose rendered value differs between two snapshots.
pub fn changed_flags(base: &Flags, other: &Flags) -> Vec<&'static str> {
    let mut before = Vec::new();
    base.for_each(|info| before.push(render_value(&info)));
    let mut changed = Vec::new();
    let mut i = 0;
    other.for_each(|info| {
        if before.get(i) != Some(&render_value(&info)) {
            changed.push(info.name);
        }
        i += 1;
    });
    changed
}

fn render_value(info: &FlagInfo<'_>) -> String {
    let mut s = String::new();
    let _ = info.value.write_value(&mut s);
    s
}
