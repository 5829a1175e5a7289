//! Patch command implementation
//!
//! Runs the pipeline up to PATCHED: resolves the plan, materializes the
//! upstreams and applies every layer and file patch, without running the
//! packager. Layers whose inputs and output are unchanged are skipped.

use anyhow::Result;
use clap::Args;

use patchstack::output::{emoji, OutputConfig};
use patchstack::phases::patch::LayerReport;
use patchstack::phases::Stage;

use super::PipelineArgs;

/// Arguments for the patch command
#[derive(Args, Debug)]
pub struct PatchArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// Execute the patch command
pub fn execute(args: PatchArgs, color_flag: &str) -> Result<()> {
    let out = OutputConfig::from_env_and_flag(color_flag);
    let config = args.pipeline.load_config()?;
    let orchestrator = args.pipeline.orchestrator(config);
    let options = args.pipeline.options(None, Stage::Patched);

    let outcome = orchestrator.run(&options)?;
    if args.quiet {
        return Ok(());
    }

    if let Some(report) = &outcome.patch_report {
        for layer in &report.layers {
            println!("{}", describe_layer(&out, layer));
        }
        for file in &report.files {
            println!("{} {}", emoji(&out, "📄", "[FILE]"), file);
        }
    }
    Ok(())
}

fn describe_layer(out: &OutputConfig, layer: &LayerReport) -> String {
    if layer.up_to_date {
        return format!("{} {}: up to date", emoji(out, "✅", "[OK]"), layer.layer);
    }
    let mut line = format!(
        "{} {}: {} patches applied, {} files changed",
        emoji(out, "🩹", "[PATCH]"),
        layer.layer,
        layer.applied.len(),
        layer.changed.len()
    );
    if layer.fuzzy_hunks > 0 {
        line.push_str(&format!(", {} hunks with offset or fuzz", layer.fuzzy_hunks));
    }
    if !layer.skipped.is_empty() {
        line.push_str(&format!(", {} excluded targets skipped", layer.skipped.len()));
    }
    line
}
