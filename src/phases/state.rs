//! Persisted build state
//!
//! ```text
//! <project>/.patchstack/
//!   plan.json          config hash, plan hash and the plan itself
//!   state.json         last stage reached, input fingerprint, artifact
//!   stamps/<layer>     fingerprints of a layer's inputs and output tree
//! ```
//!
//! Every file is written to a temporary name and renamed into place, so a
//! reader sees either the old or the new version.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::assemble::Artifact;
use super::{BuildPlan, Stage};
use crate::config::Config;
use crate::error::Result;
use crate::path::encode_path_component;

/// Name of the state directory inside the project root
pub const STATE_DIR: &str = ".patchstack";

const PLAN_FILE: &str = "plan.json";
const STATE_FILE: &str = "state.json";
const STAMPS_DIR: &str = "stamps";

/// Contents of `plan.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub config_hash: String,
    pub plan_hash: String,
    pub plan: BuildPlan,
}

/// Contents of `state.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    /// Last stage completed
    pub stage: Stage,
    /// Stage whose transition failed, if the last run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<Stage>,
    /// Fingerprint of every build input
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
}

/// Per-layer record of what was last applied successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStamp {
    /// Hash over source revision, patches, exclusions and apply settings
    pub input: String,
    /// Fingerprint of the output tree right after applying
    pub output: String,
}

/// The `.patchstack` directory of a project
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// State directory of the project `config` was loaded from
    pub fn for_config(config: &Config) -> Self {
        Self::new(config.root.join(STATE_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn read_plan(&self) -> Result<Option<PlanRecord>> {
        read_json(&self.root.join(PLAN_FILE))
    }

    pub fn write_plan(&self, record: &PlanRecord) -> Result<()> {
        write_json(&self.root.join(PLAN_FILE), record)
    }

    pub fn read_state(&self) -> Result<Option<BuildState>> {
        read_json(&self.root.join(STATE_FILE))
    }

    pub fn write_state(&self, state: &BuildState) -> Result<()> {
        write_json(&self.root.join(STATE_FILE), state)
    }

    fn stamp_path(&self, layer: &str) -> PathBuf {
        self.root.join(STAMPS_DIR).join(encode_path_component(layer))
    }

    pub fn read_stamp(&self, layer: &str) -> Result<Option<LayerStamp>> {
        read_json(&self.stamp_path(layer))
    }

    pub fn write_stamp(&self, layer: &str, stamp: &LayerStamp) -> Result<()> {
        write_json(&self.stamp_path(layer), stamp)
    }

    pub fn remove_stamp(&self, layer: &str) -> Result<()> {
        let path = self.stamp_path(layer);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Forget everything recorded for the project
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
