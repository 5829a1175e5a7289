//! Implementation of the stages of a patchstack build.
//!
//! ## Overview
//!
//! A build walks through these stages, each one a module here:
//! 1. Resolve - Turn the configuration into an explicit, ordered [`BuildPlan`]
//! 2. Materialize - Fetch every pinned upstream into the revision cache
//! 3. Patch - Copy each layer's source tree and apply its patches
//! 4. Assemble - Run the packager and label the artifact
//!
//! The [`orchestrator`] drives the stages as a state machine and persists
//! progress in the [`state`] files so repeated runs are cheap.
//!
//! Data flows strictly forward: every stage consumes the output of the one
//! before it and nothing else.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

pub mod assemble;
pub mod materialize;
pub mod orchestrator;
pub mod patch;
pub mod resolve;
pub mod state;

/// What a plan entry does
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanStep {
    /// Materialize an upstream project
    Fetch { upstream: String },
    /// Apply a patch layer
    Apply { layer: String },
    /// Patch a single upstream file; `index` points into `file_patches`
    FilePatch { index: usize, output: String },
}

impl PlanStep {
    /// Name of the graph node, unique within a plan
    pub fn node_name(&self) -> String {
        match self {
            PlanStep::Fetch { upstream } => upstream.clone(),
            PlanStep::Apply { layer } => layer.clone(),
            PlanStep::FilePatch { output, .. } => format!("file:{}", output),
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStep::Fetch { upstream } => write!(f, "fetch {}", upstream),
            PlanStep::Apply { layer } => write!(f, "apply {}", layer),
            PlanStep::FilePatch { output, .. } => write!(f, "patch file {}", output),
        }
    }
}

/// One step of the build plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Position in the plan
    pub index: usize,
    pub step: PlanStep,
    /// Indices of the entries this one consumes, all smaller than `index`
    pub depends_on: Vec<usize>,
    /// Longest dependency path from a fetch; fetches are level 0
    pub level: usize,
    /// Connected component id; entries of different chains are independent
    pub chain: usize,
}

/// The resolved, totally ordered build plan
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildPlan {
    pub entries: Vec<PlanEntry>,
}

impl BuildPlan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries grouped by chain, each group in plan order
    pub fn chains(&self) -> Vec<Vec<&PlanEntry>> {
        let mut chains: BTreeMap<usize, Vec<&PlanEntry>> = BTreeMap::new();
        for entry in &self.entries {
            chains.entry(entry.chain).or_default().push(entry);
        }
        chains.into_values().collect()
    }

    /// Upstream names in plan order
    pub fn fetches(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|e| match &e.step {
                PlanStep::Fetch { upstream } => Some(upstream.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Layer names in plan order
    pub fn layers(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|e| match &e.step {
                PlanStep::Apply { layer } => Some(layer.as_str()),
                _ => None,
            })
            .collect()
    }

    /// SHA-256 of the plan's JSON form
    pub fn hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }
}

/// Build progress, in order; a build never skips a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    Resolved,
    Materialized,
    Patched,
    Assembled,
    Done,
}

impl Stage {
    /// The stage reached after this one
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Init => Some(Stage::Resolved),
            Stage::Resolved => Some(Stage::Materialized),
            Stage::Materialized => Some(Stage::Patched),
            Stage::Patched => Some(Stage::Assembled),
            Stage::Assembled => Some(Stage::Done),
            Stage::Done => None,
        }
    }

    /// Name of the work that leads into this stage, as shown to users
    pub fn step_name(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Resolved => "resolve",
            Stage::Materialized => "materialize",
            Stage::Patched => "patch",
            Stage::Assembled => "assemble",
            Stage::Done => "finish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "INIT",
            Stage::Resolved => "RESOLVED",
            Stage::Materialized => "MATERIALIZED",
            Stage::Patched => "PATCHED",
            Stage::Assembled => "ASSEMBLED",
            Stage::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: usize, step: PlanStep, chain: usize) -> PlanEntry {
        PlanEntry {
            index,
            step,
            depends_on: vec![],
            level: 0,
            chain,
        }
    }

    #[test]
    fn test_stage_order_and_names() {
        let mut stage = Stage::Init;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(Stage::Patched.to_string(), "PATCHED");
        assert_eq!(Stage::Resolved.step_name(), "resolve");
    }

    #[test]
    fn test_chains_group_in_plan_order() {
        let plan = BuildPlan {
            entries: vec![
                entry(0, PlanStep::Fetch { upstream: "a".into() }, 0),
                entry(1, PlanStep::Fetch { upstream: "b".into() }, 1),
                entry(2, PlanStep::Apply { layer: "a-api".into() }, 0),
                entry(3, PlanStep::Apply { layer: "b-api".into() }, 1),
            ],
        };
        let chains = plan.chains();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].iter().map(|e| e.index).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(chains[1].iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(plan.fetches(), vec!["a", "b"]);
        assert_eq!(plan.layers(), vec!["a-api", "b-api"]);
    }

    #[test]
    fn test_plan_hash_is_stable() {
        let plan = BuildPlan {
            entries: vec![entry(0, PlanStep::Fetch { upstream: "a".into() }, 0)],
        };
        assert_eq!(plan.hash().unwrap(), plan.clone().hash().unwrap());
        assert_ne!(plan.hash().unwrap(), BuildPlan::default().hash().unwrap());
    }
}
