//! # CLI Command Implementations
//!
//! This module contains the implementation for each subcommand of the
//! `patchstack` command-line tool. Each subcommand is defined in its own file.
//!
//! ## Structure
//!
//! Each command module contains:
//! - An `Args` struct that defines the command-specific arguments and options,
//!   derived using `clap`.
//! - An `execute` function that takes the parsed `Args` and performs the
//!   command's logic by calling into the `patchstack` library.
//!
//! Options shared by the commands that run the pipeline live in
//! [`PipelineArgs`].

pub mod build;
pub mod clean;
pub mod patch;
pub mod resolve;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use patchstack::cache::RevisionCache;
use patchstack::config::{self, Config, DEFAULT_CONFIG_FILE};
use patchstack::phases::assemble::CommandPackager;
use patchstack::phases::orchestrator::{BuildOptions, Orchestrator};
use patchstack::phases::Stage;
use patchstack::repository::Materializer;

/// Options common to every command that runs pipeline stages
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Path to the .patchstack.yaml configuration file.
    #[arg(short, long, value_name = "FILE", env = "PATCHSTACK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// The root directory for the revision cache.
    ///
    /// If not provided, it defaults to the system's cache directory
    /// (e.g., `~/.cache/patchstack` on Linux).
    #[arg(long, value_name = "DIR", env = "PATCHSTACK_CACHE")]
    pub cache_root: Option<PathBuf>,

    /// Timeout in seconds for each fetch, layer application and packager run
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// How often a timed-out stage is retried
    #[arg(long, value_name = "N", default_value_t = 2)]
    pub retries: usize,
}

impl PipelineArgs {
    pub fn load_config(&self) -> Result<Config> {
        load_config(&self.config)
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_root.clone().unwrap_or_else(default_cache_root)
    }

    /// Orchestrator using `git` for fetching and the configured build command
    pub fn orchestrator(&self, config: Config) -> Orchestrator {
        let materializer = Materializer::with_git(RevisionCache::new(self.cache_root()));
        Orchestrator::new(config, materializer, Arc::new(CommandPackager))
    }

    pub fn options(&self, build_number: Option<String>, target: Stage) -> BuildOptions {
        BuildOptions {
            timeout: self.timeout.map(Duration::from_secs),
            retries: self.retries,
            build_number,
            target,
            ..Default::default()
        }
    }
}

/// Load and validate a configuration file, naming it in errors
pub fn load_config(path: &std::path::Path) -> Result<Config> {
    config::from_file(path).with_context(|| format!("Failed to load config from {}", path.display()))
}

/// `~/.cache/patchstack` or the platform equivalent
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".patchstack-cache"))
        .join("patchstack")
}
