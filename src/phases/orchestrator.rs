//! Orchestrator for a complete build
//!
//! Drives the stages in order as a state machine:
//!
//! ```text
//! INIT -> RESOLVED -> MATERIALIZED -> PATCHED -> ASSEMBLED -> DONE
//! ```
//!
//! Any transition can fail, which ends the run in `Failed{stage}`. A
//! transition that fails with [`Error::Timeout`] is retried up to
//! [`BuildOptions::retries`] times; every other error is final. Earlier
//! stages are never repeated by a retry, and re-running after a failure is
//! cheap because fetched upstreams are cached and up-to-date layers are
//! skipped.
//!
//! The resolved plan is recorded together with a hash of the configuration.
//! While the configuration is unchanged the recorded plan is reused instead
//! of resolving again.
//!
//! After `DONE`, running again with the same input fingerprint (configuration,
//! pins, patch hashes and build number) does nothing and returns the recorded
//! artifact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::assemble::{self, Artifact, Packager};
use super::patch::{self, PatchContext, PatchReport};
use super::state::{BuildState, PlanRecord, StateDir};
use super::{materialize, resolve, BuildPlan, Stage};
use crate::config::Config;
use crate::control::CancelToken;
use crate::error::{Error, Result};
use crate::filesystem::clear_tree;
use crate::repository::{Materialized, Materializer};
use crate::store::PatchStore;

/// Runtime knobs of one build
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Budget for each fetch, layer application and packager run
    pub timeout: Option<Duration>,
    /// How often a timed-out transition is retried
    pub retries: usize,
    /// Overrides `build.number` from the configuration
    pub build_number: Option<String>,
    pub cancel: CancelToken,
    /// Last stage to run; `Patched` stops before assembling
    pub target: Stage,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: 2,
            build_number: None,
            cancel: CancelToken::new(),
            target: Stage::Done,
        }
    }
}

/// A build that ended in `Failed{stage}`
#[derive(Error, Debug)]
#[error("failed at stage {}: {}", .stage.step_name(), .source)]
pub struct StageFailure {
    /// The stage the failed transition was heading for
    pub stage: Stage,
    pub source: Error,
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Last stage reached
    pub stage: Stage,
    pub plan: BuildPlan,
    pub artifact: Option<Artifact>,
    /// `None` when the run was a no-op or stopped before patching
    pub patch_report: Option<PatchReport>,
    /// Inputs were unchanged since the last completed build
    pub no_op: bool,
}

/// What `clean` removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub state_removed: bool,
    pub output_files_removed: usize,
    pub cache_cleared: bool,
    /// Published revisions the cache held before clearing
    pub cached_revisions: usize,
}

/// Drives a project through all build stages
pub struct Orchestrator {
    config: Config,
    materializer: Materializer,
    packager: Arc<dyn Packager>,
    state: StateDir,
    store: PatchStore,
}

impl Orchestrator {
    pub fn new(config: Config, materializer: Materializer, packager: Arc<dyn Packager>) -> Self {
        let state = StateDir::for_config(&config);
        let store = PatchStore::new(config.root.clone());
        Self {
            config,
            materializer,
            packager,
            state,
            store,
        }
    }

    /// Keep build state somewhere other than `<root>/.patchstack`
    pub fn with_state_dir(mut self, state: StateDir) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &StateDir {
        &self.state
    }

    /// Compute the build plan without running anything
    pub fn resolve(&self) -> Result<BuildPlan> {
        resolve::execute(&self.config)
    }

    /// Run the build up to `options.target`
    pub fn run(&self, options: &BuildOptions) -> std::result::Result<BuildOutcome, StageFailure> {
        let build_number = self.config.build_number(options.build_number.as_deref());

        // INIT -> RESOLVED. Nothing is written before the plan exists.
        let plan = self
            .transition(Stage::Init, Stage::Resolved, options, || self.plan())
            .map_err(|source| fail(Stage::Resolved, source))?;

        let fingerprint = self
            .input_fingerprint(&build_number)
            .map_err(|source| fail(Stage::Resolved, source))?;

        if let Some(outcome) = self
            .recorded_outcome(&plan, &fingerprint, options.target)
            .map_err(|source| fail(Stage::Resolved, source))?
        {
            info!("Inputs unchanged since the last build; nothing to do");
            return Ok(outcome);
        }

        self.persist_plan(&plan)
            .map_err(|source| fail(Stage::Resolved, source))?;
        self.record(Stage::Resolved, None, &fingerprint, None)
            .map_err(|source| fail(Stage::Resolved, source))?;

        // RESOLVED -> MATERIALIZED
        let upstreams = self.step(Stage::Resolved, Stage::Materialized, options, &fingerprint, || {
            materialize::execute(
                &plan,
                &self.config,
                &self.materializer,
                options.timeout,
                &options.cancel,
            )
        })?;

        // MATERIALIZED -> PATCHED
        let report = self.step(Stage::Materialized, Stage::Patched, options, &fingerprint, || {
            self.patch(&plan, &upstreams, options)
        })?;

        if options.target <= Stage::Patched {
            return Ok(BuildOutcome {
                stage: Stage::Patched,
                plan,
                artifact: None,
                patch_report: Some(report),
                no_op: false,
            });
        }

        // PATCHED -> ASSEMBLED
        let artifact = self.step(Stage::Patched, Stage::Assembled, options, &fingerprint, || {
            assemble::execute(
                &self.config,
                self.packager.as_ref(),
                &build_number,
                options.timeout,
            )
        })?;

        // ASSEMBLED -> DONE
        self.record(Stage::Done, None, &fingerprint, Some(&artifact))
            .map_err(|source| fail(Stage::Done, source))?;
        info!("{} -> {}", Stage::Assembled, Stage::Done);

        Ok(BuildOutcome {
            stage: Stage::Done,
            plan,
            artifact: Some(artifact),
            patch_report: Some(report),
            no_op: false,
        })
    }

    fn patch(
        &self,
        plan: &BuildPlan,
        upstreams: &HashMap<String, Materialized>,
        options: &BuildOptions,
    ) -> Result<PatchReport> {
        let ctx = PatchContext {
            config: &self.config,
            store: &self.store,
            upstreams,
            state: &self.state,
            timeout: options.timeout,
            cancel: &options.cancel,
        };
        patch::execute(plan, &ctx)
    }

    /// Run one transition with retries, then persist the new stage. On
    /// failure the state file records `Failed{to}`.
    fn step<T, F>(
        &self,
        from: Stage,
        to: Stage,
        options: &BuildOptions,
        fingerprint: &str,
        work: F,
    ) -> std::result::Result<T, StageFailure>
    where
        F: FnMut() -> Result<T>,
    {
        match self.transition(from, to, options, work) {
            Ok(value) => {
                self.record(to, None, fingerprint, None)
                    .map_err(|source| fail(to, source))?;
                Ok(value)
            }
            Err(source) => {
                if let Err(e) = self.record(from, Some(to), fingerprint, None) {
                    warn!("Could not record failed state: {}", e);
                }
                Err(fail(to, source))
            }
        }
    }

    fn transition<T, F>(&self, from: Stage, to: Stage, options: &BuildOptions, mut work: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            options.cancel.check(to.step_name())?;
            match work() {
                Ok(value) => {
                    info!("{} -> {}", from, to);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < options.retries => {
                    attempt += 1;
                    warn!(
                        "{} timed out, retrying ({}/{}): {}",
                        to.step_name(),
                        attempt,
                        options.retries,
                        e
                    );
                }
                Err(e) => {
                    error!("{} -> FAILED at {}: {}", from, to.step_name(), e);
                    return Err(e);
                }
            }
        }
    }

    fn record(
        &self,
        stage: Stage,
        failed: Option<Stage>,
        fingerprint: &str,
        artifact: Option<&Artifact>,
    ) -> Result<()> {
        self.state.write_state(&BuildState {
            stage,
            failed,
            fingerprint: fingerprint.to_string(),
            artifact: artifact.cloned(),
        })
    }

    fn config_hash(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(serde_json::to_vec(&self.config)?)))
    }

    /// The recorded plan if it was resolved from this exact configuration
    /// and is intact, otherwise a freshly resolved one
    fn plan(&self) -> Result<BuildPlan> {
        let recorded = match self.state.read_plan() {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!("Ignoring unreadable plan record: {}", e);
                None
            }
        };
        if let Some(record) = recorded {
            if record.config_hash == self.config_hash()? && record.plan.hash()? == record.plan_hash {
                debug!("Configuration unchanged; reusing recorded plan {}", record.plan_hash);
                return Ok(record.plan);
            }
        }
        self.resolve()
    }

    fn persist_plan(&self, plan: &BuildPlan) -> Result<()> {
        let config_hash = self.config_hash()?;
        let record = PlanRecord {
            config_hash,
            plan_hash: plan.hash()?,
            plan: plan.clone(),
        };
        if self.state.read_plan().ok().flatten().as_ref() != Some(&record) {
            self.state.write_plan(&record)?;
        }
        Ok(())
    }

    /// The recorded result, if the last build completed with these inputs
    fn recorded_outcome(
        &self,
        plan: &BuildPlan,
        fingerprint: &str,
        target: Stage,
    ) -> Result<Option<BuildOutcome>> {
        if target != Stage::Done {
            return Ok(None);
        }
        let Some(state) = self.state.read_state()? else {
            return Ok(None);
        };
        if state.stage != Stage::Done || state.failed.is_some() || state.fingerprint != fingerprint {
            return Ok(None);
        }
        match state.artifact {
            Some(artifact) if artifact.path.is_file() => Ok(Some(BuildOutcome {
                stage: Stage::Done,
                plan: plan.clone(),
                artifact: Some(artifact),
                patch_report: None,
                no_op: true,
            })),
            _ => Ok(None),
        }
    }

    /// Hash over everything that determines the build output
    ///
    /// Layer directories that cannot be read contribute a marker instead of
    /// failing here; the patch stage reports them properly.
    pub fn input_fingerprint(&self, build_number: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&self.config)?);
        for layer in &self.config.layers {
            hasher.update(layer.name.as_bytes());
            hasher.update([0u8]);
            match self.store.load_layer(layer) {
                Ok(loaded) => hasher.update(loaded.digest().as_bytes()),
                Err(_) => hasher.update(b"unreadable"),
            }
        }
        for file_patch in &self.config.file_patches {
            match self.store.read_patch(&file_patch.patch) {
                Ok(patch) => hasher.update(patch.digest.as_bytes()),
                Err(_) => hasher.update(b"unreadable"),
            }
        }
        hasher.update([1u8]);
        hasher.update(build_number.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Remove recorded state and optionally layer outputs and the cache
    ///
    /// Excluded paths inside layer outputs are kept.
    pub fn clean(&self, outputs: bool, cache: bool) -> Result<CleanReport> {
        let mut report = CleanReport {
            state_removed: self.state.root().exists(),
            ..Default::default()
        };
        self.state.clear()?;

        if outputs {
            for layer in &self.config.layers {
                let dir = self.config.resolve_path(&layer.output_dir);
                report.output_files_removed += clear_tree(&dir, &layer.excludes)?;
            }
        }
        if cache {
            let cache = self.materializer.cache();
            report.cached_revisions = cache.entries()?.len();
            cache.clear()?;
            report.cache_cleared = true;
        }
        Ok(report)
    }
}

fn fail(stage: Stage, source: Error) -> StageFailure {
    StageFailure { stage, source }
}
