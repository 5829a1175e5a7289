//! CLI argument parsing and command dispatch

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;

/// patchstack - Build forks from layered patch sets
#[derive(Parser, Debug)]
#[command(name = "patchstack")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Colorize output (always, never, auto)
    #[arg(long, global = true, value_name = "WHEN", default_value = "auto")]
    color: String,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the build plan computed from the configuration
    Resolve(commands::resolve::ResolveArgs),

    /// Run the full pipeline and produce the labeled artifact
    Build(commands::build::BuildArgs),

    /// Apply all patch layers without assembling
    Patch(commands::patch::PatchArgs),

    /// Remove build state, layer outputs or the revision cache
    Clean(commands::clean::CleanArgs),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        init_logging(&self.log_level);

        match self.command {
            Commands::Resolve(args) => commands::resolve::execute(args, &self.color),
            Commands::Build(args) => commands::build::execute(args, &self.color),
            Commands::Patch(args) => commands::patch::execute(args, &self.color),
            Commands::Clean(args) => commands::clean::execute(args, &self.color),
        }
    }
}

/// Route `log` output to stderr; `RUST_LOG` takes precedence over the flag
fn init_logging(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_build_with_globals() {
        let cli = Cli::try_parse_from([
            "patchstack",
            "--color",
            "never",
            "build",
            "--build-number",
            "12",
            "--timeout",
            "30",
        ])
        .unwrap();
        assert_eq!(cli.color, "never");
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.build_number.as_deref(), Some("12"));
                assert_eq!(args.pipeline.timeout, Some(30));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_subcommand_is_usage_error() {
        let err = Cli::try_parse_from(["patchstack", "frobnicate"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
