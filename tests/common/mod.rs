//! Shared test utilities for integration and E2E tests.
//!
//! ## Usage
//!
//! Add `mod common;` to your test file, then use the helpers:
//!
//! ```rust,ignore
//! mod common;
//! use common::prelude::*;
//!
//! #[test]
//! fn test_example() {
//!     let fixture = TestFixture::new().with_config(configs::TWO_CHAINS);
//!     fixture.command().arg("resolve").assert().success();
//! }
//! ```

use assert_fs::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Re-export commonly used test dependencies for convenience.
pub mod prelude {
    pub use assert_cmd::cargo::cargo_bin_cmd;
    pub use assert_fs::prelude::*;
    #[allow(unused_imports)]
    pub use assert_fs::TempDir;
    pub use predicates::prelude::*;

    #[allow(unused_imports)]
    pub use super::configs;
    #[allow(unused_imports)]
    pub use super::git_upstream;
    pub use super::TestFixture;
}

/// Common configuration YAML snippets for testing.
#[allow(dead_code)]
pub mod configs {
    /// Two upstreams, each with its own chain of layers.
    pub const TWO_CHAINS: &str = r#"
upstreams:
  - name: core
    repo: https://example.com/core.git
    ref: main
  - name: extras
    repo: https://example.com/extras.git
    ref: v1.2.0
layers:
  - name: core-api
    source: core
    upstream_path: api
    patches_dir: patches/api
    output_dir: out/api
  - name: core-server
    source: core-api
    patches_dir: patches/server
    output_dir: out/server
  - name: extras-lib
    source: extras
    patches_dir: patches/extras
    output_dir: out/extras
"#;

    /// Two layers feeding each other.
    pub const CYCLE: &str = r#"
layers:
  - name: a
    source: b
    patches_dir: patches/a
    output_dir: out/a
  - name: b
    source: a
    patches_dir: patches/b
    output_dir: out/b
"#;

    /// A layer whose source does not exist.
    pub const UNKNOWN_SOURCE: &str = r#"
layers:
  - name: api
    source: nowhere
    patches_dir: patches/api
    output_dir: out/api
"#;

    /// Invalid YAML for error testing.
    pub const INVALID_YAML: &str = "upstreams: [name: core: repo";

    /// No upstreams, no layers.
    pub const EMPTY: &str = "# nothing to build yet\n{}\n";
}

/// Create a git repository at `dir` holding `files` in one commit on `main`
///
/// Returns the full commit hash.
#[allow(dead_code)]
pub fn git_upstream(dir: &Path, files: &[(&str, &str)]) -> String {
    std::fs::create_dir_all(dir).expect("Failed to create upstream directory");
    for (path, content) in files {
        let file = dir.join(path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create upstream subdirectory");
        }
        std::fs::write(file, content).expect("Failed to write upstream file");
    }
    let git = |args: &[&str]| {
        let output = Command::new("git")
            .current_dir(dir)
            .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
            .args(args)
            .output()
            .expect("Failed to run git");
        assert!(output.status.success(), "git {:?} failed: {:?}", args, output);
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    };
    git(&["init", "--quiet", "--initial-branch=main"]);
    git(&["add", "."]);
    git(&["commit", "--quiet", "-m", "upstream"]);
    git(&["rev-parse", "HEAD"])
}

/// A temporary project directory with optional config, patches and files.
pub struct TestFixture {
    temp_dir: assert_fs::TempDir,
}

impl TestFixture {
    /// Create a new test fixture with an empty temporary directory.
    pub fn new() -> Self {
        Self {
            temp_dir: assert_fs::TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Add a `.patchstack.yaml` configuration file with the given content.
    pub fn with_config(self, content: &str) -> Self {
        self.temp_dir
            .child(".patchstack.yaml")
            .write_str(content)
            .expect("Failed to write config file");
        self
    }

    /// Add a file with the given path and content.
    #[allow(dead_code)]
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.temp_dir
            .child(path)
            .write_str(content)
            .expect("Failed to write file");
        self
    }

    /// Get the path to the temporary directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Get the path to the config file.
    #[allow(dead_code)]
    pub fn config_path(&self) -> PathBuf {
        self.temp_dir.path().join(".patchstack.yaml")
    }

    /// Directory used as the revision cache for commands run by this fixture.
    pub fn cache_path(&self) -> PathBuf {
        self.temp_dir.path().join(".cache")
    }

    /// Create a child path in the temp directory.
    #[allow(dead_code)]
    pub fn child(&self, path: &str) -> assert_fs::fixture::ChildPath {
        self.temp_dir.child(path)
    }

    /// Create a command running in this fixture's directory with a private
    /// cache and no color.
    pub fn command(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("patchstack");
        cmd.current_dir(self.path())
            .env("PATCHSTACK_CACHE", self.cache_path())
            .env_remove("PATCHSTACK_CONFIG")
            .env_remove("BUILD_NUMBER")
            .env("NO_COLOR", "1");
        cmd
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_with_config() {
        let fixture = TestFixture::new().with_config(configs::EMPTY);
        assert!(fixture.config_path().exists());
    }

    #[test]
    fn test_configs_are_valid_yaml() {
        for config in [configs::TWO_CHAINS, configs::CYCLE, configs::UNKNOWN_SOURCE, configs::EMPTY] {
            serde_yaml::from_str::<serde_yaml::Value>(config).expect("Config should be valid YAML");
        }
    }

    #[test]
    fn test_invalid_yaml_is_actually_invalid() {
        assert!(serde_yaml::from_str::<serde_yaml::Value>(configs::INVALID_YAML).is_err());
    }
}
