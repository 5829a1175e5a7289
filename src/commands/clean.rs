//! Clean command implementation
//!
//! Removes the recorded build state (`.patchstack/`) so the next build runs
//! every stage again. `--outputs` also empties the layer output directories,
//! keeping excluded paths; `--cache` deletes the revision cache.

use anyhow::Result;
use clap::Args;

use patchstack::output::{emoji, OutputConfig};

use super::PipelineArgs;

/// Arguments for the clean command
#[derive(Args, Debug)]
pub struct CleanArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Also delete generated files in layer output directories
    #[arg(long)]
    pub outputs: bool,

    /// Also delete the revision cache
    #[arg(long)]
    pub cache: bool,
}

/// Execute the clean command
pub fn execute(args: CleanArgs, color_flag: &str) -> Result<()> {
    let out = OutputConfig::from_env_and_flag(color_flag);
    let config = args.pipeline.load_config()?;
    let orchestrator = args.pipeline.orchestrator(config);

    let report = orchestrator.clean(args.outputs, args.cache)?;

    if report.state_removed {
        println!("{} Removed build state", emoji(&out, "🧹", "[CLEAN]"));
    } else {
        println!("{} No build state to remove", emoji(&out, "✅", "[OK]"));
    }
    if args.outputs {
        println!(
            "{} Removed {} generated files",
            emoji(&out, "🧹", "[CLEAN]"),
            report.output_files_removed
        );
    }
    if report.cache_cleared {
        println!(
            "{} Cleared {} cached revisions from {}",
            emoji(&out, "🧹", "[CLEAN]"),
            report.cached_revisions,
            args.pipeline.cache_root().display()
        );
    }
    Ok(())
}
