//! Working trees on disk and in-memory staging of edits to them
//!
//! A [`WorkingTree`] is a directory owned by exactly one pipeline stage at a
//! time. Edits are first collected in a [`StagedTree`] and only written
//! back with [`WorkingTree::commit`] once every edit succeeded, which keeps
//! a failed layer from leaving a half-patched tree behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::path::is_excluded;

/// A staged version of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    /// File content as bytes
    pub content: Vec<u8>,
    /// Requested executable bit; `None` keeps whatever is on disk
    pub executable: Option<bool>,
}

impl File {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            executable: None,
        }
    }
}

/// A source tree directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Read a file, `None` if it does not exist
    pub fn read(&self, relative: &str) -> Result<Option<Vec<u8>>> {
        let path = self.full_path(relative);
        match fs::read(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Filesystem {
                message: format!("Failed to read '{}': {}", path.display(), e),
            }),
        }
    }

    /// All regular files as sorted `/`-separated relative paths
    pub fn files(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| Error::Filesystem {
                message: format!("Failed to walk '{}': {}", self.root.display(), e),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            files.push(relative_string(&self.root, entry.path())?);
        }
        files.sort();
        Ok(files)
    }

    /// SHA-256 over every path and content in sorted order
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for relative in self.files()? {
            let content = fs::read(self.full_path(&relative))?;
            hasher.update(relative.as_bytes());
            hasher.update([0u8]);
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
            hasher.update([u8::from(is_executable(&self.full_path(&relative)))]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Write staged edits to disk
    pub fn commit(&self, staged: StagedTree) -> Result<()> {
        for (relative, change) in staged.changes {
            let path = self.full_path(&relative);
            match change {
                Some(file) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).map_err(|e| Error::Filesystem {
                            message: format!("Failed to create directory '{}': {}", parent.display(), e),
                        })?;
                    }
                    fs::write(&path, &file.content).map_err(|e| Error::Filesystem {
                        message: format!("Failed to write file '{}': {}", path.display(), e),
                    })?;
                    if let Some(executable) = file.executable {
                        set_executable(&path, executable)?;
                    }
                }
                None => {
                    if path.exists() {
                        fs::remove_file(&path).map_err(|e| Error::Filesystem {
                            message: format!("Failed to remove file '{}': {}", path.display(), e),
                        })?;
                        prune_empty_parents(&self.root, &path);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Pending edits layered over a [`WorkingTree`]
#[derive(Debug)]
pub struct StagedTree<'a> {
    base: &'a WorkingTree,
    /// `None` marks a deletion
    changes: BTreeMap<String, Option<File>>,
}

impl<'a> StagedTree<'a> {
    pub fn new(base: &'a WorkingTree) -> Self {
        Self {
            base,
            changes: BTreeMap::new(),
        }
    }

    /// Current content of a file, staged edits first
    pub fn read(&self, relative: &str) -> Result<Option<Vec<u8>>> {
        match self.changes.get(relative) {
            Some(Some(file)) => Ok(Some(file.content.clone())),
            Some(None) => Ok(None),
            None => self.base.read(relative),
        }
    }

    pub fn write(&mut self, relative: &str, file: File) {
        self.changes.insert(relative.to_string(), Some(file));
    }

    pub fn remove(&mut self, relative: &str) {
        self.changes.insert(relative.to_string(), None);
    }

    /// Paths with pending edits, sorted
    pub fn changed_paths(&self) -> Vec<&str> {
        self.changes.keys().map(String::as_str).collect()
    }
}

/// Make `dst` mirror `src`, leaving paths matched by `excludes` untouched on
/// both sides
///
/// Non-excluded files in `dst` that are absent from `src` are deleted;
/// excluded files already in `dst` survive.
pub fn sync_tree(src: &Path, dst: &Path, excludes: &[String]) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::NotFound {
            what: "source tree".to_string(),
            path: src.display().to_string(),
        });
    }

    clear_tree(dst, excludes)?;
    fs::create_dir_all(dst)?;
    for relative in WorkingTree::new(src).files()? {
        if is_excluded(&relative, excludes)? {
            continue;
        }
        let target = dst.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src.join(&relative), &target).map_err(|e| Error::Filesystem {
            message: format!("Failed to copy '{}' into '{}': {}", relative, dst.display(), e),
        })?;
    }
    Ok(())
}

/// Delete every file under `dst` not matched by `excludes`
///
/// Returns the number of files removed.
pub fn clear_tree(dst: &Path, excludes: &[String]) -> Result<usize> {
    let mut removed = 0;
    for relative in WorkingTree::new(dst).files()? {
        if !is_excluded(&relative, excludes)? {
            let path = dst.join(&relative);
            fs::remove_file(&path)?;
            prune_empty_parents(dst, &path);
            removed += 1;
        }
    }
    Ok(removed)
}

fn relative_string(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| Error::Filesystem {
        message: format!("'{}' is outside '{}'", path.display(), root.display()),
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn prune_empty_parents(root: &Path, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Fails (and stops) on the first non-empty directory
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| Error::Filesystem {
        message: format!("Failed to set permissions on '{}': {}", path.display(), e),
    })
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}
