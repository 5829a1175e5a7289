//! # Source Tree Materializer
//!
//! This module provides the `Materializer`, which turns an [`UpstreamProject`]
//! pin into a local, read-only snapshot of the upstream sources.
//!
//! ## Design
//!
//! Fetching goes through the [`Fetcher`] trait so the network side can be
//! swapped out. In the main application [`GitFetcher`] shells out to the
//! system `git`; in tests a double that counts its calls is injected
//! instead, which lets the cache behaviour be checked without any network.
//!
//! Snapshots are stored in the [`RevisionCache`]. A request first looks for
//! a published entry; on a miss it takes the per-key write lock, looks again
//! (another writer may have published meanwhile), fetches into the partial
//! directory, verifies the pin and only then publishes.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::cache::{CacheKey, CachedRevision, RevisionCache};
use crate::config::UpstreamProject;
use crate::control::Deadline;
use crate::error::{Error, Result};
use crate::filesystem::WorkingTree;
use crate::git;

/// Port for retrieving upstream sources
pub trait Fetcher: Send + Sync {
    /// Fetch `repo` at `rev` into `dest` (created by the fetcher) and return
    /// the full hash of the commit that was checked out.
    fn fetch(&self, repo: &str, rev: &str, dest: &Path, deadline: Deadline) -> Result<String>;
}

/// Default fetcher using the system `git` binary
#[derive(Debug, Default, Clone, Copy)]
pub struct GitFetcher;

impl Fetcher for GitFetcher {
    fn fetch(&self, repo: &str, rev: &str, dest: &Path, deadline: Deadline) -> Result<String> {
        git::fetch_revision(repo, rev, dest, deadline)
    }
}

/// A materialized upstream snapshot
#[derive(Debug, Clone)]
pub struct Materialized {
    pub tree: WorkingTree,
    /// Commit hash the pin resolved to
    pub resolved: String,
    /// Whether the snapshot came from the cache without fetching
    pub cache_hit: bool,
}

/// Fetches upstream projects into the revision cache
#[derive(Clone)]
pub struct Materializer {
    fetcher: Arc<dyn Fetcher>,
    cache: RevisionCache,
}

impl Materializer {
    pub fn new(fetcher: Arc<dyn Fetcher>, cache: RevisionCache) -> Self {
        Self { fetcher, cache }
    }

    /// Materializer backed by `git`
    pub fn with_git(cache: RevisionCache) -> Self {
        Self::new(Arc::new(GitFetcher), cache)
    }

    pub fn cache(&self) -> &RevisionCache {
        &self.cache
    }

    /// Return the snapshot of `project` at its pinned ref, fetching on a miss
    pub fn materialize(&self, project: &UpstreamProject, deadline: Deadline) -> Result<Materialized> {
        let key = CacheKey::new(&project.name, &project.r#ref);

        if let Some(entry) = self.cache.lookup(&key)? {
            debug!("Cache hit for {}@{}", project.name, project.r#ref);
            return Ok(Materialized {
                tree: WorkingTree::new(entry.tree),
                resolved: entry.revision.resolved,
                cache_hit: true,
            });
        }

        self.cache.with_write_lock(&key, || {
            // Another writer may have published while we waited
            if let Some(entry) = self.cache.lookup(&key)? {
                debug!("Cache filled concurrently for {}@{}", project.name, project.r#ref);
                return Ok(Materialized {
                    tree: WorkingTree::new(entry.tree),
                    resolved: entry.revision.resolved,
                    cache_hit: true,
                });
            }

            info!("Fetching {} at {} from {}", project.name, project.r#ref, project.repo);
            let partial = self.cache.partial_path(&key);
            let fetched = self
                .fetcher
                .fetch(&project.repo, &project.r#ref, &partial, deadline)
                .map_err(|e| {
                    discard(&partial);
                    e
                })?;

            if !git::revision_matches(&project.r#ref, &fetched) {
                discard(&partial);
                return Err(Error::RevisionMismatch {
                    project: project.name.clone(),
                    expected: project.r#ref.clone(),
                    actual: fetched,
                });
            }

            let entry = self.cache.publish(
                &key,
                &CachedRevision {
                    project: project.name.clone(),
                    r#ref: project.r#ref.clone(),
                    resolved: fetched,
                },
            )?;
            Ok(Materialized {
                tree: WorkingTree::new(entry.tree),
                resolved: entry.revision.resolved,
                cache_hit: false,
            })
        })
    }
}

fn discard(partial: &Path) {
    if partial.exists() {
        let _ = fs::remove_dir_all(partial);
    }
}
