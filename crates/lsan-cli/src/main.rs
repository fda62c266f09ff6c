//! # lsan CLI
//!
//! Operator tooling for the LeakSanitizer runtime: inspect how an options
//! string resolves, lint one, or run a program with the runtime preloaded.

use anyhow::Result;
use clap::{Parser, Subcommand};
use lsan_config::logging::{init_logging, LogLevel};

mod flags;
mod run;

/// LeakSanitizer runtime tooling
#[derive(Parser)]
#[command(name = "lsan")]
#[command(version, about, long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve options the way the runtime would and print the snapshot
    Flags(flags::FlagsArgs),

    /// Parse an options string and report unknown keys and parse errors
    Check {
        /// Options string, e.g. "verbosity=1:exitcode=0"
        #[arg(value_name = "OPTIONS")]
        options: String,
    },

    /// Execute a command with the runtime preloaded
    Run(run::RunArgs),
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    init_logging(match cli.verbose {
        0 => LogLevel::Warn,
        1 => LogLevel::Info,
        _ => LogLevel::Debug,
    });

    match cli.command {
        Commands::Flags(args) => flags::cmd_flags(args),
        Commands::Check { options } => {
            if !flags::cmd_check(&options)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Run(args) => {
            let code = run::cmd_run(args)?;
            std::process::exit(code);
        }
    }
}
