//! # Error Handling
//!
//! This module defines the centralized error type for `patchstack`. It uses
//! the `thiserror` library to describe every failure mode of the pipeline as
//! one variant of a single `Error` enum.
//!
//! ## Taxonomy
//!
//! The pipeline failures map one-to-one onto variants:
//!
//! - **`NotFound`**: a configured resource (layer directory, upstream name,
//!   artifact) does not exist. Fatal.
//! - **`RevisionMismatch`**: the fetched tree does not match its pin. Fatal,
//!   never silently replaced by another revision.
//! - **`PatchConflict`**: a patch cannot be applied even with bounded fuzz.
//!   Carries the patch id and hunk header so the patch can be regenerated.
//! - **`CyclicDependency`**: the layer graph contains a cycle. Raised before
//!   any fetch or apply work begins.
//! - **`Assembly`**: the packager exited non-zero. Its log is kept verbatim.
//! - **`Timeout`**: a fetch or apply exceeded its deadline. This is the only
//!   retryable variant (see [`Error::is_retryable`]).
//!
//! The remaining variants wrap configuration, subprocess and library errors.

use thiserror::Error;

/// Main error type for patchstack operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error occurred while parsing or validating the configuration file.
    #[error("Configuration parsing error: {message}{}", hint.as_ref().map(|h| format!("\n  hint: {}", h)).unwrap_or_default())]
    ConfigParse {
        message: String,
        /// Optional hint for how to fix the configuration issue
        hint: Option<String>,
    },

    /// A configured resource is missing.
    #[error("Not found: {what}: {path}")]
    NotFound { what: String, path: String },

    /// The fetched revision does not match the pinned one.
    #[error("Revision mismatch for {project}: pinned {expected}, fetched {actual}")]
    RevisionMismatch {
        project: String,
        expected: String,
        actual: String,
    },

    /// A patch could not be applied, even with fuzz.
    #[error("Patch conflict in {patch_id} at {hunk}: {reason}")]
    PatchConflict {
        patch_id: String,
        /// Header of the failing hunk, e.g. `@@ -12,7 +12,8 @@`
        hunk: String,
        reason: String,
    },

    /// A cycle was detected among upstreams and layers.
    #[error("Cyclic dependency detected: {cycle}")]
    CyclicDependency { cycle: String },

    /// The external packager failed.
    #[error("Assembly failed with exit code {}: {log}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    Assembly {
        /// `None` when the process was terminated by a signal
        exit_code: Option<i32>,
        log: String,
    },

    /// An operation exceeded its deadline.
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// The build was cancelled between stages.
    #[error("Build cancelled before stage {stage}")]
    Cancelled { stage: String },

    /// An error occurred while executing a Git command.
    #[error("Git command failed for {url}: {command} - {stderr}")]
    GitCommand {
        command: String,
        url: String,
        stderr: String,
    },

    /// An error occurred while reading or writing a working tree.
    #[error("Filesystem operation error: {message}")]
    Filesystem { message: String },

    /// An I/O error, wrapped from `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML parsing error, wrapped from `serde_yaml::Error`.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A JSON error from persisted state, wrapped from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A regular expression error, wrapped from `regex::Error`.
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// A glob pattern error, wrapped from `glob::PatternError`.
    #[error("Glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),

    /// An error indicating that a mutex or other lock has been poisoned.
    #[error("Lock poisoned: {context}")]
    LockPoisoned { context: String },
}

impl Error {
    /// Whether a stage that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// A convenient type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
