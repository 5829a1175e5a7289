//! # patchstack
//!
//! This library builds forks of upstream source trees from layered patch
//! sets. It is used by the `patchstack` command-line tool but every stage is
//! usable on its own.
//!
//! ## Quick Example
//!
//! ```
//! use patchstack::config;
//! use patchstack::phases::resolve;
//!
//! let yaml = r#"
//! upstreams:
//!   - name: paper
//!     repo: https://github.com/PaperMC/Paper.git
//!     ref: main
//! layers:
//!   - name: paper-api
//!     source: paper
//!     patches_dir: patches/api
//!     output_dir: paper-api
//! "#;
//! let config = config::parse(yaml).unwrap();
//! let plan = resolve::execute(&config).unwrap();
//! assert_eq!(plan.fetches(), vec!["paper"]);
//! assert_eq!(plan.layers(), vec!["paper-api"]);
//! ```
//!
//! ## Core Concepts
//!
//! - **Configuration (`config`)**: the `.patchstack.yaml` schema: upstream
//!   pins, patch layers, single-file patches and the build command.
//! - **Patch Store (`store`, `diff`)**: ordered `*.patch` files per layer,
//!   parsed into hunks.
//! - **Materializer (`repository`, `git`, `cache`)**: fetches each upstream
//!   at its pinned revision into a shared on-disk cache.
//! - **Working trees (`filesystem`)**: layer output directories, with edits
//!   staged in memory until a whole layer has applied.
//! - **Phases (`phases`)**: the build stages and the orchestrator that runs
//!   them as a resumable state machine.
//!
//! ## Execution Flow
//!
//! `phases::orchestrator::Orchestrator::run` goes through
//! `INIT -> RESOLVED -> MATERIALIZED -> PATCHED -> ASSEMBLED -> DONE`:
//!
//! 1.  **Resolve**: order upstream fetches and layers into a `BuildPlan`.
//! 2.  **Materialize**: fetch every upstream (in parallel, cached).
//! 3.  **Patch**: mirror each layer's source and apply its patches; chains
//!     that do not depend on each other run in parallel.
//! 4.  **Assemble**: run the packager and label the artifact with the build
//!     number.

pub mod cache;
pub mod config;
pub mod control;
pub mod diff;
pub mod error;
pub mod filesystem;
pub mod git;
pub mod output;
pub mod path;
pub mod phases;
pub mod process;
pub mod repository;
pub mod store;

#[cfg(test)]
mod path_proptest;
