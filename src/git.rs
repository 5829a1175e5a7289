//! Thin wrappers around the system `git` binary.
//!
//! Using the system command picks up whatever authentication the user has
//! configured (SSH keys, credential helpers, tokens in `~/.gitconfig`).

use std::fs;
use std::path::Path;
use std::process::Command;

use crate::control::Deadline;
use crate::error::{Error, Result};
use crate::process;

/// Run one git subcommand in `dir`, returning trimmed stdout
fn git(dir: &Path, args: &[&str], url: &str, deadline: Deadline) -> Result<String> {
    let mut command = Command::new("git");
    command.current_dir(dir).args(args);
    let operation = format!("git {} ({})", args.first().copied().unwrap_or(""), url);
    let output = process::run(command, deadline, &operation).map_err(|e| match e {
        Error::Io(io) => Error::GitCommand {
            command: args.join(" "),
            url: url.to_string(),
            stderr: io.to_string(),
        },
        other => other,
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = if stderr.contains("Authentication failed")
            || stderr.contains("Permission denied")
            || stderr.contains("Could not read from remote repository")
        {
            format!(
                "Authentication failed. Make sure you have access to the repository.\n\
                For private repos, ensure you have an SSH key in ssh-agent,\n\
                git credentials, or a personal access token configured.\n\
                Error: {}",
                stderr
            )
        } else {
            stderr.trim().to_string()
        };
        return Err(Error::GitCommand {
            command: args.join(" "),
            url: url.to_string(),
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Fetch `url` at `rev` into `target_dir` as a detached, shallow checkout
///
/// `rev` may be a commit hash, a tag or a branch. Returns the full hash of
/// the checked out commit. The `.git` directory is removed afterwards so the
/// directory holds a plain source snapshot.
pub fn fetch_revision(url: &str, rev: &str, target_dir: &Path, deadline: Deadline) -> Result<String> {
    if target_dir.exists() {
        fs::remove_dir_all(target_dir)?;
    }
    fs::create_dir_all(target_dir)?;

    git(target_dir, &["init", "--quiet"], url, deadline)?;
    git(target_dir, &["remote", "add", "origin", url], url, deadline)?;
    git(
        target_dir,
        &["fetch", "--quiet", "--depth=1", "origin", rev],
        url,
        deadline,
    )?;
    git(
        target_dir,
        &["checkout", "--quiet", "--detach", "FETCH_HEAD"],
        url,
        deadline,
    )?;
    let head = git(target_dir, &["rev-parse", "HEAD"], url, deadline)?;

    fs::remove_dir_all(target_dir.join(".git"))?;
    Ok(head)
}

/// Whether `rev` looks like an (abbreviated) commit hash rather than a
/// symbolic ref
pub fn is_commit_hash(rev: &str) -> bool {
    (7..=40).contains(&rev.len()) && rev.chars().all(|c| c.is_ascii_hexdigit())
}

/// Whether the fetched commit satisfies the pin
///
/// Commit pins must match exactly (a prefix match for abbreviated hashes);
/// symbolic refs accept whatever commit they currently point at.
pub fn revision_matches(pin: &str, fetched: &str) -> bool {
    if is_commit_hash(pin) {
        let pin = pin.to_ascii_lowercase();
        let fetched = fetched.to_ascii_lowercase();
        if pin.len() == 40 {
            fetched == pin
        } else {
            fetched.starts_with(&pin)
        }
    } else {
        true
    }
}
