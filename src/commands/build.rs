//! Build command implementation
//!
//! Runs the whole pipeline:
//! 1. Resolve the build plan
//! 2. Materialize upstreams (cached)
//! 3. Apply every patch layer
//! 4. Run the packager and label the artifact
//!
//! A failed stage is reported as `failed at stage <stage>` and the process
//! exits with code 1.

use anyhow::Result;
use clap::Args;
use std::time::Instant;

use patchstack::output::{emoji, stage_name, OutputConfig};
use patchstack::phases::Stage;

use super::PipelineArgs;

/// Arguments for the build command
#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Build number used to label the artifact (defaults to build.number, then "local")
    #[arg(long, value_name = "NUMBER", env = "BUILD_NUMBER")]
    pub build_number: Option<String>,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// Execute the build command
pub fn execute(args: BuildArgs, color_flag: &str) -> Result<()> {
    let out = OutputConfig::from_env_and_flag(color_flag);
    let start_time = Instant::now();

    let config = args.pipeline.load_config()?;
    let orchestrator = args.pipeline.orchestrator(config);
    let options = args.pipeline.options(args.build_number.clone(), Stage::Done);

    if !args.quiet {
        println!("{} patchstack build", emoji(&out, "🔨", "[BUILD]"));
        println!();
    }

    match orchestrator.run(&options) {
        Ok(outcome) => {
            if !args.quiet {
                if outcome.no_op {
                    println!(
                        "{} Inputs unchanged, nothing to do",
                        emoji(&out, "✅", "[OK]")
                    );
                } else {
                    println!(
                        "{} Built successfully in {:.2}s",
                        emoji(&out, "✅", "[OK]"),
                        start_time.elapsed().as_secs_f64()
                    );
                }
                if let Some(report) = &outcome.patch_report {
                    let applied: usize = report.layers.iter().map(|l| l.applied.len()).sum();
                    println!("   {} layers, {} patches applied", report.layers.len(), applied);
                }
                if let Some(artifact) = &outcome.artifact {
                    println!("   Artifact: {}", artifact.path.display());
                }
            }
            Ok(())
        }
        Err(failure) => {
            if !args.quiet {
                println!(
                    "{} Build stopped during {}",
                    emoji(&out, "❌", "[ERR]"),
                    stage_name(&out, failure.stage.step_name())
                );
                println!();
            }
            Err(failure.into())
        }
    }
}
