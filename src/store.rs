//! Patch store: ordered patch files per layer
//!
//! A layer's patches are the `*.patch` files directly inside its
//! `patches_dir`, applied in file name order (`0001-...`, `0002-...` as
//! written by `git format-patch`). The store only enumerates and reads; it
//! never modifies anything.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::LayerConfig;
use crate::diff::{self, PatchSet};
use crate::error::{Error, Result};

/// One patch file of a layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchFile {
    /// File name, unique within its layer
    pub id: String,
    pub path: PathBuf,
    /// SHA-256 of the raw file content
    pub digest: String,
    pub patch: PatchSet,
}

impl PatchFile {
    /// Build a patch from in-memory text
    pub fn from_text(id: &str, text: &str) -> Result<Self> {
        Ok(Self {
            id: id.to_string(),
            path: PathBuf::from(id),
            digest: digest(text.as_bytes()),
            patch: diff::parse(id, text)?,
        })
    }
}

/// An ordered patch sequence plus the paths it must not touch
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchLayer {
    pub name: String,
    pub patches: Vec<PatchFile>,
    pub excludes: Vec<String>,
}

impl PatchLayer {
    /// SHA-256 over patch ids, patch digests and exclusions, in order
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for patch in &self.patches {
            hasher.update(patch.id.as_bytes());
            hasher.update([0u8]);
            hasher.update(patch.digest.as_bytes());
        }
        for exclude in &self.excludes {
            hasher.update([1u8]);
            hasher.update(exclude.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Read access to the patch directories of a project
#[derive(Debug, Clone)]
pub struct PatchStore {
    root: PathBuf,
}

impl PatchStore {
    /// `root` is the directory relative patch paths are resolved against
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Paths of the `*.patch` files in `patches_dir`, in application order
    pub fn list_patches(&self, patches_dir: &Path) -> Result<Vec<PathBuf>> {
        let dir = self.resolve(patches_dir);
        if !dir.is_dir() {
            return Err(Error::NotFound {
                what: "patch directory".to_string(),
                path: dir.display().to_string(),
            });
        }
        let mut patches: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "patch"))
            .collect();
        patches.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(patches)
    }

    /// Read and parse one patch file
    pub fn read_patch(&self, path: &Path) -> Result<PatchFile> {
        let full = self.resolve(path);
        let bytes = fs::read(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound {
                    what: "patch file".to_string(),
                    path: full.display().to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        let id = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| full.display().to_string());
        let text = String::from_utf8(bytes.clone()).map_err(|_| Error::PatchConflict {
            patch_id: id.clone(),
            hunk: "-".to_string(),
            reason: "patch file is not valid UTF-8".to_string(),
        })?;
        Ok(PatchFile {
            patch: diff::parse(&id, &text)?,
            digest: digest(&bytes),
            path: full,
            id,
        })
    }

    /// Load every patch of a configured layer
    pub fn load_layer(&self, layer: &LayerConfig) -> Result<PatchLayer> {
        let patches = self
            .list_patches(&layer.patches_dir)?
            .iter()
            .map(|path| self.read_patch(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(PatchLayer {
            name: layer.name.clone(),
            patches,
            excludes: layer.excludes.clone(),
        })
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
