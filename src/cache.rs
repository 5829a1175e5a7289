//! On-disk cache of materialized upstream revisions
//!
//! Layout, one directory per `(project, revision)` key:
//!
//! ```text
//! <cache_root>/
//!   <project>@<revision>-<hash>/
//!     tree/            published snapshot
//!     tree.partial/    in-flight fetch, never read
//!     revision.json    completion marker, written last
//!   <project>@<revision>-<hash>.lock
//! ```
//!
//! `<project>` and `<revision>` are made filesystem-safe, which can map two
//! keys to the same text, so `<hash>` is taken over the raw key. A key is a
//! cache hit only once its marker exists and names that same key. Writers for one key are
//! serialized twice: by an in-process mutex per key, and by an exclusive
//! advisory lock on the `.lock` file for other processes sharing the cache.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::path::encode_path_component;

const TREE_DIR: &str = "tree";
const PARTIAL_DIR: &str = "tree.partial";
const MARKER_FILE: &str = "revision.json";

/// Cache key combining project name and pinned revision
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub project: String,
    pub revision: String,
}

impl CacheKey {
    pub fn new(project: &str, revision: &str) -> Self {
        Self {
            project: project.to_string(),
            revision: revision.to_string(),
        }
    }

    fn dir_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.project.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.revision.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!(
            "{}@{}-{}",
            encode_path_component(&self.project),
            encode_path_component(&self.revision),
            &digest[..12]
        )
    }
}

/// Contents of the completion marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRevision {
    pub project: String,
    /// The pin as configured
    pub r#ref: String,
    /// Full commit hash the pin resolved to
    pub resolved: String,
}

/// A published cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub revision: CachedRevision,
    pub tree: PathBuf,
}

/// Cache of fetched upstream trees keyed by `(project, revision)`
#[derive(Debug, Clone)]
pub struct RevisionCache {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>>,
}

impl RevisionCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.dir_name())
    }

    /// Path of the published snapshot for `key`
    pub fn tree_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(TREE_DIR)
    }

    /// Scratch directory a fetch writes into before publishing
    pub fn partial_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(PARTIAL_DIR)
    }

    /// Look up a published entry; safe to call concurrently with writers
    ///
    /// An unreadable marker, or one recorded for a different key, is a miss
    /// and the entry is fetched again.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let marker = self.entry_dir(key).join(MARKER_FILE);
        if !marker.is_file() {
            return Ok(None);
        }
        let revision: CachedRevision = match serde_json::from_slice(&fs::read(&marker)?) {
            Ok(revision) => revision,
            Err(e) => {
                warn!("Ignoring corrupt cache marker {}: {}", marker.display(), e);
                return Ok(None);
            }
        };
        if revision.project != key.project || revision.r#ref != key.revision {
            warn!(
                "Cache marker {} belongs to {}@{}, not {}@{}",
                marker.display(),
                revision.project,
                revision.r#ref,
                key.project,
                key.revision
            );
            return Ok(None);
        }
        let tree = self.tree_path(key);
        if !tree.is_dir() {
            return Ok(None);
        }
        Ok(Some(CacheEntry { revision, tree }))
    }

    /// Run `f` while holding the write lock for `key`
    ///
    /// A second caller for the same key blocks here until the first returns,
    /// then typically finds the entry published via [`RevisionCache::lookup`].
    pub fn with_write_lock<T, F>(&self, key: &CacheKey, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let key_lock = {
            let mut locks = self.locks.lock().map_err(|_| Error::LockPoisoned {
                context: "revision cache key table".to_string(),
            })?;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let _guard = key_lock.lock().map_err(|_| Error::LockPoisoned {
            context: format!("revision cache entry {}", key.dir_name()),
        })?;

        fs::create_dir_all(&self.root)?;
        let lock_path = self.root.join(format!("{}.lock", key.dir_name()));
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        FileExt::lock_exclusive(&lock_file)?;
        let result = f();
        let _ = FileExt::unlock(&lock_file);
        result
    }

    /// Promote the partial directory to the published tree and write the
    /// marker. Must be called under [`RevisionCache::with_write_lock`].
    pub fn publish(&self, key: &CacheKey, revision: &CachedRevision) -> Result<CacheEntry> {
        let partial = self.partial_path(key);
        let tree = self.tree_path(key);
        if tree.exists() {
            fs::remove_dir_all(&tree)?;
        }
        fs::rename(&partial, &tree)?;

        let marker = self.entry_dir(key).join(MARKER_FILE);
        let tmp = marker.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(revision)?)?;
        fs::rename(&tmp, &marker)?;

        Ok(CacheEntry {
            revision: revision.clone(),
            tree,
        })
    }

    /// All published entries, sorted by directory name
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut entries = Vec::new();
        for dir in dirs {
            let marker = dir.join(MARKER_FILE);
            if let Ok(bytes) = fs::read(&marker) {
                if let Ok(revision) = serde_json::from_slice::<CachedRevision>(&bytes) {
                    entries.push(CacheEntry {
                        revision,
                        tree: dir.join(TREE_DIR),
                    });
                }
            }
        }
        Ok(entries)
    }

    /// Delete the whole cache directory
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}
