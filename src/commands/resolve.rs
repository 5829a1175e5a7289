//! # Resolve Command Implementation
//!
//! Prints the build plan computed from the configuration: every upstream
//! fetch, layer and file patch in the order the build would run them, with
//! their dependency level and chain.
//!
//! - `--json` prints the plan as JSON, together with its hash.
//! - `--tree` draws each chain as a tree rooted at its upstream fetch.
//!
//! This command is read-only: it never fetches, applies or writes state.

use anyhow::Result;
use clap::Args;
use ptree::{print_tree, TreeItem};
use serde_json::json;
use std::path::PathBuf;

use patchstack::config::DEFAULT_CONFIG_FILE;
use patchstack::output::{emoji, OutputConfig};
use patchstack::phases::orchestrator::StageFailure;
use patchstack::phases::{resolve, BuildPlan, PlanEntry, Stage};

/// Show the build plan
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Path to the .patchstack.yaml configuration file.
    #[arg(short, long, value_name = "FILE", env = "PATCHSTACK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Print the plan as JSON
    #[arg(long, conflicts_with = "tree")]
    pub json: bool,

    /// Draw the plan as one tree per chain
    #[arg(long)]
    pub tree: bool,
}

/// Execute the `resolve` command.
pub fn execute(args: ResolveArgs, color_flag: &str) -> Result<()> {
    let out = OutputConfig::from_env_and_flag(color_flag);
    let config = super::load_config(&args.config)?;

    let plan = resolve::execute(&config).map_err(|source| StageFailure {
        stage: Stage::Resolved,
        source,
    })?;

    if args.json {
        let document = json!({
            "plan_hash": plan.hash()?,
            "entries": plan.entries,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    if args.tree {
        for root in build_trees(&plan) {
            print_tree(&root).map_err(|e| anyhow::anyhow!("Failed to display tree: {}", e))?;
        }
        return Ok(());
    }

    println!(
        "{} Build plan for {} ({} steps, {} independent chains)",
        emoji(&out, "📋", "[PLAN]"),
        args.config.display(),
        plan.len(),
        plan.chains().len()
    );
    for line in plan_lines(&plan) {
        println!("{}", line);
    }
    Ok(())
}

/// One line per entry: position, step, level and chain
fn plan_lines(plan: &BuildPlan) -> Vec<String> {
    plan.entries
        .iter()
        .map(|entry| {
            let deps = if entry.depends_on.is_empty() {
                String::new()
            } else {
                let list: Vec<String> = entry.depends_on.iter().map(|d| (d + 1).to_string()).collect();
                format!(" after {}", list.join(", "))
            };
            format!(
                "  {:>3}. {} [level {}, chain {}]{}",
                entry.index + 1,
                entry.step,
                entry.level,
                entry.chain,
                deps
            )
        })
        .collect()
}

/// Tree node structure for ptree visualization
#[derive(Clone, Debug, PartialEq, Eq)]
struct TreeNode {
    label: String,
    children: Vec<TreeNode>,
}

impl TreeItem for TreeNode {
    type Child = TreeNode;

    fn write_self<W: std::io::Write>(&self, f: &mut W, _style: &ptree::Style) -> std::io::Result<()> {
        write!(f, "{}", self.label)
    }

    fn children(&self) -> std::borrow::Cow<'_, [Self::Child]> {
        std::borrow::Cow::Borrowed(&self.children)
    }
}

/// Entries without dependencies become roots; each entry hangs below the
/// entries it depends on
fn build_trees(plan: &BuildPlan) -> Vec<TreeNode> {
    plan.entries
        .iter()
        .filter(|e| e.depends_on.is_empty())
        .map(|root| build_node(plan, root))
        .collect()
}

fn build_node(plan: &BuildPlan, entry: &PlanEntry) -> TreeNode {
    let children = plan
        .entries
        .iter()
        .filter(|e| e.depends_on.first() == Some(&entry.index))
        .map(|child| build_node(plan, child))
        .collect();
    TreeNode {
        label: entry.step.to_string(),
        children,
    }
}
