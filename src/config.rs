//! # Configuration Schema and Parsing
//!
//! This module defines the data structures that represent the `.patchstack.yaml`
//! configuration file and the logic for parsing and validating it.
//!
//! ## Example
//!
//! ```yaml
//! upstreams:
//!   - name: purpur
//!     repo: https://github.com/PurpurMC/Purpur.git
//!     ref: 0123456789abcdef0123456789abcdef01234567
//!
//! layers:
//!   - name: purpur-api
//!     source: purpur
//!     upstream_path: purpur-api
//!     patches_dir: cookie-api/purpur-patches
//!     output_dir: purpur-api
//!     excludes: ["build.gradle.kts", "paper-patches"]
//!
//! file_patches:
//!   - upstream: purpur
//!     path: purpur-server/build.gradle.kts
//!     output: cookie-server/build.gradle.kts
//!     patch: cookie-server/build.gradle.kts.patch
//!
//! build:
//!   command: ["./gradlew", "createMojmapPaperclipJar"]
//!   artifact: "cookie-server/build/libs/*-paperclip-*.jar"
//!   label: cookie-build
//! ```
//!
//! A layer's `source` names either an upstream project or another layer. The
//! second form chains layers: the named layer's output tree becomes this
//! layer's input.
//!
//! All relative paths are resolved against the directory holding the
//! configuration file (the project root).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::{is_contained, normalize};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = ".patchstack.yaml";

/// Build number used when none is configured
pub const DEFAULT_BUILD_NUMBER: &str = "local";

/// An upstream source tree this project patches
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamProject {
    /// Unique name, referenced by layers and file patches
    pub name: String,
    /// Repository locator passed to the fetcher
    pub repo: String,
    /// Pinned revision: a commit hash, or a branch or tag name
    pub r#ref: String,
}

/// A patch layer declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerConfig {
    /// Unique name of the layer
    pub name: String,
    /// Name of the upstream project or layer whose tree this layer patches
    pub source: String,
    /// Sub-directory of the source tree that forms this layer's input
    #[serde(default, alias = "upstreamPath")]
    pub upstream_path: Option<String>,
    /// Directory holding the ordered `*.patch` files
    #[serde(alias = "patchesDir")]
    pub patches_dir: PathBuf,
    /// Directory the patched tree is written to
    #[serde(alias = "outputDir")]
    pub output_dir: PathBuf,
    /// Glob patterns of paths the layer never copies nor patches
    #[serde(default)]
    pub excludes: Vec<String>,
}

/// A single upstream file copied out and patched with one patch file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilePatchConfig {
    /// Name of the upstream project holding the file
    pub upstream: String,
    /// Path of the file inside the upstream tree
    pub path: String,
    /// Where the patched file is written
    #[serde(alias = "outputFile")]
    pub output: PathBuf,
    /// The patch to apply
    #[serde(alias = "patchFile")]
    pub patch: PathBuf,
}

/// Packaging step configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Program and arguments of the packager
    pub command: Vec<String>,
    /// Working directory of the packager, relative to the project root
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Glob locating the produced artifact, relative to the workdir
    pub artifact: String,
    /// Prefix of the relabeled artifact name (`<label>.<number>.<ext>`)
    #[serde(default)]
    pub label: Option<String>,
    /// Build identifier; overridden by `--build-number` / `BUILD_NUMBER`
    #[serde(default)]
    pub number: Option<String>,
}

/// Tolerances of the patch applier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyConfig {
    /// Maximum number of context lines that may be ignored at either end of
    /// a hunk
    #[serde(default = "default_fuzz")]
    pub fuzz: usize,
    /// Maximum distance, in lines, a hunk may have drifted
    #[serde(default = "default_max_offset")]
    pub max_offset: usize,
}

fn default_fuzz() -> usize {
    2
}

fn default_max_offset() -> usize {
    1000
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            fuzz: default_fuzz(),
            max_offset: default_max_offset(),
        }
    }
}

/// The whole `.patchstack.yaml` document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub upstreams: Vec<UpstreamProject>,
    #[serde(default)]
    pub layers: Vec<LayerConfig>,
    #[serde(default)]
    pub file_patches: Vec<FilePatchConfig>,
    #[serde(default)]
    pub build: Option<BuildConfig>,
    #[serde(default)]
    pub apply: ApplyConfig,
    /// Project root, the directory of the configuration file
    #[serde(skip)]
    pub root: PathBuf,
}

impl Config {
    pub fn upstream(&self, name: &str) -> Option<&UpstreamProject> {
        self.upstreams.iter().find(|u| u.name == name)
    }

    pub fn layer(&self, name: &str) -> Option<&LayerConfig> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Resolve a configured path against the project root
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Effective build number: explicit override, then config, then `local`
    pub fn build_number(&self, override_number: Option<&str>) -> String {
        override_number
            .map(str::to_string)
            .or_else(|| self.build.as_ref().and_then(|b| b.number.clone()))
            .unwrap_or_else(|| DEFAULT_BUILD_NUMBER.to_string())
    }
}

/// Parse a configuration from YAML text
///
/// The returned config has its root set to the current directory; use
/// [`from_file`] to anchor it at the file's directory.
pub fn parse(yaml_content: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(yaml_content).map_err(|e| Error::ConfigParse {
        message: e.to_string(),
        hint: None,
    })?;
    config.root = PathBuf::from(".");
    validate(&config)?;
    Ok(config)
}

/// Load and validate a configuration file
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound {
                what: "configuration file".to_string(),
                path: path.display().to_string(),
            }
        } else {
            Error::Io(e)
        }
    })?;
    let mut config = parse(&content)?;
    config.root = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(config)
}

fn config_error(message: String, hint: Option<&str>) -> Error {
    Error::ConfigParse {
        message,
        hint: hint.map(str::to_string),
    }
}

/// Check structural rules serde cannot express
pub fn validate(config: &Config) -> Result<()> {
    let mut names = HashSet::new();

    for upstream in &config.upstreams {
        if upstream.name.trim().is_empty() {
            return Err(config_error("upstream with empty name".to_string(), None));
        }
        if upstream.repo.trim().is_empty() {
            return Err(config_error(
                format!("upstream '{}' has an empty repo", upstream.name),
                Some("Set 'repo:' to a git URL or path"),
            ));
        }
        if upstream.r#ref.trim().is_empty() {
            return Err(config_error(
                format!("upstream '{}' has an empty ref", upstream.name),
                Some("Pin 'ref:' to a commit hash, tag or branch"),
            ));
        }
        if !names.insert(upstream.name.as_str()) {
            return Err(config_error(
                format!("duplicate name '{}'", upstream.name),
                Some("Upstream and layer names share one namespace"),
            ));
        }
    }

    for layer in &config.layers {
        if layer.name.trim().is_empty() {
            return Err(config_error("layer with empty name".to_string(), None));
        }
        if !names.insert(layer.name.as_str()) {
            return Err(config_error(
                format!("duplicate name '{}'", layer.name),
                Some("Upstream and layer names share one namespace"),
            ));
        }
        check_relative(&layer.output_dir, &format!("layer '{}' output_dir", layer.name))?;
        if let Some(sub) = &layer.upstream_path {
            check_relative(Path::new(sub), &format!("layer '{}' upstream_path", layer.name))?;
        }
        for pattern in &layer.excludes {
            glob::Pattern::new(pattern)?;
        }
    }

    for file_patch in &config.file_patches {
        if config.upstream(&file_patch.upstream).is_none() {
            return Err(config_error(
                format!(
                    "file patch for '{}' references unknown upstream '{}'",
                    file_patch.path, file_patch.upstream
                ),
                None,
            ));
        }
        check_relative(Path::new(&file_patch.path), "file patch path")?;
        check_relative(&file_patch.output, "file patch output")?;
    }

    check_disjoint(config)?;

    if let Some(build) = &config.build {
        if build.command.is_empty() {
            return Err(config_error(
                "build.command is empty".to_string(),
                Some("e.g. command: [\"./gradlew\", \"build\"]"),
            ));
        }
        glob::Pattern::new(&build.artifact)?;
    }

    Ok(())
}

/// Reject absolute paths, parent references and the project root itself
fn check_relative(path: &Path, what: &str) -> Result<()> {
    if !is_contained(path) {
        return Err(config_error(
            format!(
                "{} must be a relative path inside the project, not the project root: {}",
                what,
                path.display()
            ),
            None,
        ));
    }
    Ok(())
}

/// Generated paths are rewritten on every run, so none may contain, or sit
/// inside, another generated path or a patch input
fn check_disjoint(config: &Config) -> Result<()> {
    let mut outputs: Vec<(String, PathBuf)> = Vec::new();
    let mut inputs: Vec<(String, PathBuf)> = Vec::new();
    for layer in &config.layers {
        outputs.push((
            format!("layer '{}' output_dir", layer.name),
            normalize(&layer.output_dir),
        ));
        inputs.push((
            format!("layer '{}' patches_dir", layer.name),
            normalize(&layer.patches_dir),
        ));
    }
    for file_patch in &config.file_patches {
        outputs.push((
            format!("file patch output '{}'", file_patch.output.display()),
            normalize(&file_patch.output),
        ));
        inputs.push((
            format!("file patch '{}'", file_patch.patch.display()),
            normalize(&file_patch.patch),
        ));
    }

    for (i, (what, path)) in outputs.iter().enumerate() {
        for (other_what, other) in outputs[i + 1..].iter().chain(&inputs) {
            if path.starts_with(other) || other.starts_with(path) {
                return Err(config_error(
                    format!("{} overlaps {}", what, other_what),
                    Some("Give every output its own directory, apart from patches and other outputs"),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
upstreams:
  - name: purpur
    repo: https://github.com/PurpurMC/Purpur.git
    ref: 0123456789abcdef0123456789abcdef01234567
layers:
  - name: paper-api
    source: purpur
    upstreamPath: paper-api
    patchesDir: cookie-api/paper-patches
    outputDir: paper-api
  - name: purpur-api
    source: purpur
    upstream_path: purpur-api
    patches_dir: cookie-api/purpur-patches
    output_dir: purpur-api
    excludes: ["build.gradle.kts", "paper-patches"]
file_patches:
  - upstream: purpur
    path: purpur-server/build.gradle.kts
    output: cookie-server/build.gradle.kts
    patch: cookie-server/build.gradle.kts.patch
build:
  command: ["./gradlew", "createMojmapPaperclipJar"]
  artifact: "cookie-server/build/libs/*.jar"
  label: cookie-build
"#;

    #[test]
    fn test_parse_full_config() {
        let config = parse(FULL).unwrap();
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.layers[0].upstream_path.as_deref(), Some("paper-api"));
        assert_eq!(config.layers[0].patches_dir, PathBuf::from("cookie-api/paper-patches"));
        assert_eq!(config.layers[1].excludes.len(), 2);
        assert_eq!(config.file_patches.len(), 1);
        assert_eq!(config.apply, ApplyConfig::default());
        assert_eq!(config.build.as_ref().unwrap().label.as_deref(), Some("cookie-build"));
    }

    #[test]
    fn test_parse_empty_document() {
        let config = parse("{}").unwrap();
        assert!(config.upstreams.is_empty());
        assert!(config.layers.is_empty());
        assert!(config.build.is_none());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = parse("upstreams: []\nbogus: 1\n");
        assert!(matches!(result, Err(Error::ConfigParse { .. })));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
upstreams:
  - { name: core, repo: r, ref: main }
layers:
  - { name: core, source: core, patches_dir: p, output_dir: o }
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate name 'core'"));
    }

    #[test]
    fn test_empty_ref_rejected() {
        let yaml = "upstreams:\n  - { name: core, repo: r, ref: '' }\n";
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("empty ref"));
    }

    #[test]
    fn test_output_dir_must_stay_inside_project() {
        for bad in ["/abs", "../escape", "."] {
            let yaml = format!(
                "layers:\n  - {{ name: l, source: s, patches_dir: p, output_dir: '{}' }}\n",
                bad
            );
            assert!(parse(&yaml).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_overlapping_outputs_rejected() {
        let cases = [
            // patches live inside the generated tree
            "layers:\n  - { name: l, source: s, patches_dir: out/patches, output_dir: out }\n",
            // generated tree inside the patches
            "layers:\n  - { name: l, source: s, patches_dir: patches, output_dir: ./patches/out }\n",
            // two layers share a tree
            "layers:\n  - { name: a, source: s, patches_dir: pa, output_dir: out }\n  - { name: b, source: s, patches_dir: pb, output_dir: out/b }\n",
            // another layer's patches under this layer's output
            "layers:\n  - { name: a, source: s, patches_dir: api/patches, output_dir: x }\n  - { name: b, source: s, patches_dir: pb, output_dir: api }\n",
        ];
        for yaml in cases {
            let err = parse(yaml).unwrap_err();
            assert!(err.to_string().contains("overlaps"), "{}: {}", yaml, err);
        }

        let yaml = r#"
upstreams:
  - { name: core, repo: r, ref: main }
layers:
  - { name: api, source: core, patches_dir: patches/api, output_dir: out/api }
file_patches:
  - { upstream: core, path: build.gradle, output: out/api/build.gradle, patch: patches/build.patch }
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err
            .to_string()
            .contains("layer 'api' output_dir overlaps file patch output 'out/api/build.gradle'"));
    }

    #[test]
    fn test_sibling_outputs_accepted() {
        let yaml = r#"
upstreams:
  - { name: core, repo: r, ref: main }
layers:
  - { name: api, source: core, patches_dir: patches/api, output_dir: out/api }
  - { name: apiserver, source: api, patches_dir: patches/server, output_dir: out/api-server }
file_patches:
  - { upstream: core, path: build.gradle, output: out/build.gradle, patch: patches/build.gradle.patch }
"#;
        assert!(parse(yaml).is_ok());
    }

    #[test]
    fn test_file_patch_unknown_upstream() {
        let yaml = r#"
file_patches:
  - { upstream: ghost, path: a.txt, output: b.txt, patch: a.patch }
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown upstream 'ghost'"));
    }

    #[test]
    fn test_build_number_precedence() {
        let mut config = parse(FULL).unwrap();
        assert_eq!(config.build_number(None), "local");
        config.build.as_mut().unwrap().number = Some("41".to_string());
        assert_eq!(config.build_number(None), "41");
        assert_eq!(config.build_number(Some("42")), "42");
    }

    #[test]
    fn test_from_file_sets_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, FULL).unwrap();

        let config = from_file(&path).unwrap();
        assert_eq!(config.root, dir.path());
        assert_eq!(
            config.resolve_path(Path::new("paper-api")),
            dir.path().join("paper-api")
        );
    }

    #[test]
    fn test_from_file_missing() {
        let err = from_file("/nonexistent/.patchstack.yaml").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
