//! Stage 4: Assembling the Artifact
//!
//! Packaging is delegated to a [`Packager`]. The default, [`CommandPackager`],
//! runs `build.command` in `build.workdir` and then looks for the file
//! matching `build.artifact`.
//!
//! When `build.label` is set, the produced file is renamed to
//! `<label>.<build_number>.<ext>` after every earlier `<label>.*.<ext>` in
//! the same directory has been removed, so only the latest labeled artifact
//! remains.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{BuildConfig, Config};
use crate::control::Deadline;
use crate::error::{Error, Result};
use crate::process;

/// The labeled build output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub label: Option<String>,
    pub build_number: String,
    pub path: PathBuf,
}

/// What a packager produced
#[derive(Debug, Clone)]
pub struct PackageOutput {
    pub artifact: PathBuf,
    /// Combined packager output
    pub log: String,
}

/// Port for the external build tool
pub trait Packager: Send + Sync {
    /// Build in `workdir` and return the produced file. A failed build must
    /// be reported as [`Error::Assembly`].
    fn package(&self, build: &BuildConfig, workdir: &Path, deadline: Deadline) -> Result<PackageOutput>;
}

/// Runs the configured command as a subprocess
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandPackager;

impl Packager for CommandPackager {
    fn package(&self, build: &BuildConfig, workdir: &Path, deadline: Deadline) -> Result<PackageOutput> {
        let (program, args) = build.command.split_first().ok_or_else(|| Error::ConfigParse {
            message: "build.command is empty".to_string(),
            hint: None,
        })?;
        let mut command = Command::new(program);
        command.args(args).current_dir(workdir);

        info!("Running packager: {}", build.command.join(" "));
        let output = process::run(command, deadline, "packager").map_err(|e| match e {
            Error::Io(io) => Error::Assembly {
                exit_code: None,
                log: format!("failed to start '{}': {}", program, io),
            },
            other => other,
        })?;

        let log = output.combined_log();
        if !output.status.success() {
            return Err(Error::Assembly {
                exit_code: output.status.code(),
                log,
            });
        }

        let artifact = locate_artifact(workdir, &build.artifact, build.label.as_deref())?;
        Ok(PackageOutput { artifact, log })
    }
}

/// Find the file the packager produced
///
/// Files that already carry the label are ignored. When several files
/// match, the most recently modified one wins.
pub fn locate_artifact(workdir: &Path, pattern: &str, label: Option<&str>) -> Result<PathBuf> {
    let full_pattern = workdir.join(pattern);
    let mut candidates: Vec<PathBuf> = glob::glob(&full_pattern.to_string_lossy())?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .filter(|path| !label.is_some_and(|l| carries_label(path, l)))
        .collect();
    candidates.sort();

    match candidates.len() {
        0 => Err(Error::NotFound {
            what: "build artifact".to_string(),
            path: full_pattern.display().to_string(),
        }),
        1 => Ok(candidates.remove(0)),
        n => {
            warn!("{} files match '{}', using the newest", n, pattern);
            let newest = candidates
                .into_iter()
                .max_by_key(|path| {
                    fs::metadata(path)
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH)
                })
                .ok_or_else(|| Error::NotFound {
                    what: "build artifact".to_string(),
                    path: full_pattern.display().to_string(),
                })?;
            Ok(newest)
        }
    }
}

fn label_pattern(label: &str, extension: Option<&str>) -> Result<glob::Pattern> {
    let escaped = glob::Pattern::escape(label);
    let pattern = match extension {
        Some(ext) => format!("{}.*.{}", escaped, glob::Pattern::escape(ext)),
        None => format!("{}.*", escaped),
    };
    Ok(glob::Pattern::new(&pattern)?)
}

fn carries_label(path: &Path, label: &str) -> bool {
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    label_pattern(label, extension.as_deref()).is_ok_and(|p| p.matches(&name))
}

/// Rename `produced` to `<label>.<build_number>.<ext>`, removing earlier
/// labeled artifacts first. Without a label the file is left as is.
pub fn relabel(produced: &Path, label: Option<&str>, build_number: &str) -> Result<Artifact> {
    let Some(label) = label else {
        return Ok(Artifact {
            label: None,
            build_number: build_number.to_string(),
            path: produced.to_path_buf(),
        });
    };

    let dir = produced.parent().unwrap_or_else(|| Path::new("."));
    let extension = produced.extension().map(|e| e.to_string_lossy().into_owned());
    let pattern = label_pattern(label, extension.as_deref())?;

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path == produced || !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if pattern.matches(&name) {
            debug!("Removing previous artifact {}", path.display());
            fs::remove_file(&path)?;
        }
    }

    let file_name = match &extension {
        Some(ext) => format!("{}.{}.{}", label, build_number, ext),
        None => format!("{}.{}", label, build_number),
    };
    let target = dir.join(file_name);
    if target != produced {
        fs::rename(produced, &target)?;
    }
    info!("Artifact: {}", target.display());

    Ok(Artifact {
        label: Some(label.to_string()),
        build_number: build_number.to_string(),
        path: target,
    })
}

/// Execute Stage 4: package the patched trees and label the result
pub fn execute(
    config: &Config,
    packager: &dyn Packager,
    build_number: &str,
    timeout: Option<Duration>,
) -> Result<Artifact> {
    let build = config.build.as_ref().ok_or_else(|| Error::NotFound {
        what: "build section in configuration".to_string(),
        path: "build".to_string(),
    })?;
    let workdir = match &build.workdir {
        Some(dir) => config.resolve_path(dir),
        None => config.root.clone(),
    };

    let output = packager.package(build, &workdir, Deadline::after(timeout))?;
    debug!("Packager output:\n{}", output.log);
    relabel(&output.artifact, build.label.as_deref(), build_number)
}
