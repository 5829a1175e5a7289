//! Stage 3: Applying Patch Layers
//!
//! For every layer in plan order, the layer's source tree (an upstream
//! snapshot or the output of another layer) is mirrored into the layer's
//! output directory and the layer's patches are applied on top.
//!
//! ## Applying a layer
//!
//! All edits of a layer go into a [`StagedTree`]. Only when every hunk of
//! every patch has been placed is the staged tree committed, so a conflict
//! in the last patch leaves the output exactly as it was before the layer
//! started.
//!
//! Each hunk is first tried where its header says it belongs (shifted by
//! the drift of earlier hunks). If the old-side lines are not there, the
//! hunk is searched for at growing distances up to `apply.max_offset` lines,
//! and then again with up to `apply.fuzz` context lines ignored at each end.
//! A hunk that still does not match aborts the layer with
//! [`Error::PatchConflict`].
//!
//! ## Re-running
//!
//! After a successful apply the layer's stamp records a hash of its inputs
//! and the fingerprint of the output tree. A later run with identical inputs
//! and an untouched output tree skips the layer entirely.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use rayon::prelude::*;
use sha2::{Digest, Sha256};

use super::state::{LayerStamp, StateDir};
use super::{BuildPlan, PlanEntry, PlanStep};
use crate::config::{ApplyConfig, Config, LayerConfig};
use crate::control::{CancelToken, Deadline};
use crate::diff::{FileDiff, FileOperation, Hunk, HunkLine};
use crate::error::{Error, Result};
use crate::filesystem::{sync_tree, File, StagedTree, WorkingTree};
use crate::path::{is_contained, is_excluded};
use crate::repository::Materialized;
use crate::store::{PatchFile, PatchLayer, PatchStore};

/// Outcome of one layer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LayerReport {
    pub layer: String,
    /// Patch ids applied, in order
    pub applied: Vec<String>,
    /// Hunks that needed an offset or fuzz
    pub fuzzy_hunks: usize,
    /// Patch targets skipped because they are excluded
    pub skipped: Vec<String>,
    /// Paths written or deleted, sorted
    pub changed: Vec<String>,
    /// The stamp matched and nothing was done
    pub up_to_date: bool,
}

impl LayerReport {
    fn new(layer: &str) -> Self {
        Self {
            layer: layer.to_string(),
            ..Default::default()
        }
    }
}

/// Outcome of the whole stage
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchReport {
    /// Layer reports in plan order
    pub layers: Vec<LayerReport>,
    /// Output paths of file patches written
    pub files: Vec<String>,
}

/// Inputs of the patch stage
pub struct PatchContext<'a> {
    pub config: &'a Config,
    pub store: &'a PatchStore,
    /// Materialized upstreams by name
    pub upstreams: &'a HashMap<String, Materialized>,
    pub state: &'a StateDir,
    /// Budget for each layer application
    pub timeout: Option<Duration>,
    pub cancel: &'a CancelToken,
}

enum Outcome {
    Layer(LayerReport),
    File(String),
}

/// Execute Stage 3: apply every layer and file patch of the plan
///
/// Chains run in parallel; entries within a chain run in plan order.
pub fn execute(plan: &BuildPlan, ctx: &PatchContext<'_>) -> Result<PatchReport> {
    let chains = plan.chains();
    let errors: Mutex<Vec<(usize, Error)>> = Mutex::new(Vec::new());
    let outcomes: Mutex<Vec<(usize, Outcome)>> = Mutex::new(Vec::new());

    chains.par_iter().enumerate().for_each(|(chain_index, chain)| {
        for entry in chain {
            match run_entry(entry, ctx) {
                Ok(Some(outcome)) => {
                    if let Ok(mut outcomes) = outcomes.lock() {
                        outcomes.push((entry.index, outcome));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if let Ok(mut errors) = errors.lock() {
                        errors.push((chain_index, e));
                    }
                    // Later entries of this chain depend on the failed one
                    return;
                }
            }
        }
    });

    let mut errors = errors.into_inner().map_err(|_| Error::LockPoisoned {
        context: "patch stage errors".to_string(),
    })?;
    if !errors.is_empty() {
        errors.sort_by_key(|(chain, _)| *chain);
        let (_, first) = errors.remove(0);
        return Err(first);
    }

    let mut outcomes = outcomes.into_inner().map_err(|_| Error::LockPoisoned {
        context: "patch stage results".to_string(),
    })?;
    outcomes.sort_by_key(|(index, _)| *index);

    let mut report = PatchReport::default();
    for (_, outcome) in outcomes {
        match outcome {
            Outcome::Layer(layer) => report.layers.push(layer),
            Outcome::File(path) => report.files.push(path),
        }
    }
    Ok(report)
}

fn run_entry(entry: &PlanEntry, ctx: &PatchContext<'_>) -> Result<Option<Outcome>> {
    match &entry.step {
        PlanStep::Fetch { .. } => Ok(None),
        PlanStep::Apply { layer } => {
            ctx.cancel.check("patch")?;
            let config = ctx.config.layer(layer).ok_or_else(|| Error::NotFound {
                what: "layer".to_string(),
                path: layer.clone(),
            })?;
            run_layer(config, ctx).map(|r| Some(Outcome::Layer(r)))
        }
        PlanStep::FilePatch { index, .. } => {
            ctx.cancel.check("patch")?;
            run_file_patch(*index, ctx).map(|p| Some(Outcome::File(p)))
        }
    }
}

fn run_layer(layer_config: &LayerConfig, ctx: &PatchContext<'_>) -> Result<LayerReport> {
    let (source_dir, source_stamp) = layer_source(layer_config, ctx)?;
    let layer = ctx.store.load_layer(layer_config)?;
    let input = stamp_input(&source_stamp, layer_config, &layer, ctx.config.apply);
    let output = WorkingTree::new(ctx.config.resolve_path(&layer_config.output_dir));

    if let Some(stamp) = ctx.state.read_stamp(&layer.name)? {
        if stamp.input == input && output.root().is_dir() && output.fingerprint()? == stamp.output {
            info!("Layer {} is up to date", layer.name);
            return Ok(LayerReport {
                up_to_date: true,
                ..LayerReport::new(&layer.name)
            });
        }
    }

    ctx.state.remove_stamp(&layer.name)?;
    info!(
        "Applying layer {} ({} patches) onto {}",
        layer.name,
        layer.patches.len(),
        output.root().display()
    );
    sync_tree(&source_dir, output.root(), &layer.excludes)?;

    let report = apply_layer(
        &output,
        &layer,
        ctx.config.apply,
        Deadline::after(ctx.timeout),
    )?;

    ctx.state.write_stamp(
        &layer.name,
        &LayerStamp {
            input,
            output: output.fingerprint()?,
        },
    )?;
    Ok(report)
}

/// Directory a layer copies from, plus a stamp identifying its content
fn layer_source(layer: &LayerConfig, ctx: &PatchContext<'_>) -> Result<(PathBuf, String)> {
    if let Some(upstream) = ctx.upstreams.get(&layer.source) {
        let mut dir = upstream.tree.root().to_path_buf();
        if let Some(sub) = &layer.upstream_path {
            dir = dir.join(sub);
        }
        return Ok((dir, format!("upstream:{}", upstream.resolved)));
    }

    if let Some(source_layer) = ctx.config.layer(&layer.source) {
        let dir = ctx.config.resolve_path(&source_layer.output_dir);
        let dir = match &layer.upstream_path {
            Some(sub) => dir.join(sub),
            None => dir,
        };
        let stamp = match ctx.state.read_stamp(&source_layer.name)? {
            Some(stamp) => stamp.output,
            None => WorkingTree::new(&dir).fingerprint()?,
        };
        return Ok((dir, format!("layer:{}", stamp)));
    }

    Err(Error::NotFound {
        what: format!("source of layer '{}'", layer.name),
        path: layer.source.clone(),
    })
}

fn stamp_input(source: &str, config: &LayerConfig, layer: &PatchLayer, apply: ApplyConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(config.upstream_path.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(layer.digest().as_bytes());
    hasher.update((apply.fuzz as u64).to_le_bytes());
    hasher.update((apply.max_offset as u64).to_le_bytes());
    hex::encode(hasher.finalize())
}

fn run_file_patch(index: usize, ctx: &PatchContext<'_>) -> Result<String> {
    let file_patch = ctx.config.file_patches.get(index).ok_or_else(|| Error::NotFound {
        what: "file patch".to_string(),
        path: index.to_string(),
    })?;
    let upstream = ctx
        .upstreams
        .get(&file_patch.upstream)
        .ok_or_else(|| Error::NotFound {
            what: "materialized upstream".to_string(),
            path: file_patch.upstream.clone(),
        })?;

    let source = upstream.tree.root().join(&file_patch.path);
    let content = fs::read(&source).map_err(|_| Error::NotFound {
        what: format!("upstream file in '{}'", file_patch.upstream),
        path: file_patch.path.clone(),
    })?;
    let patch = ctx.store.read_patch(&file_patch.patch)?;
    if patch.patch.files.len() != 1 {
        return Err(Error::PatchConflict {
            patch_id: patch.id.clone(),
            hunk: "-".to_string(),
            reason: format!(
                "a file patch must touch exactly one file, found {}",
                patch.patch.files.len()
            ),
        });
    }

    let text = as_text(&patch.id, &file_patch.path, content)?;
    let deadline = Deadline::after(ctx.timeout);
    let (patched, fuzzy) = apply_hunks(
        &patch.id,
        &file_patch.path,
        &text,
        &patch.patch.files[0].hunks,
        ctx.config.apply,
        deadline,
    )?;
    if fuzzy > 0 {
        warn!("{}: {} hunk(s) applied with offset or fuzz", patch.id, fuzzy);
    }

    let output = ctx.config.resolve_path(&file_patch.output);
    let unchanged = fs::read(&output).is_ok_and(|existing| existing == patched.as_bytes());
    if !unchanged {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&output, patched.as_bytes())?;
    }
    debug!("Patched {} into {}", file_patch.path, output.display());
    Ok(file_patch.output.to_string_lossy().replace('\\', "/"))
}

/// Apply all patches of `layer` to `tree`, committing only if all succeed
pub fn apply_layer(
    tree: &WorkingTree,
    layer: &PatchLayer,
    apply: ApplyConfig,
    deadline: Deadline,
) -> Result<LayerReport> {
    let mut staged = StagedTree::new(tree);
    let mut report = LayerReport::new(&layer.name);

    for patch in &layer.patches {
        debug!(
            "Applying {} to {} in layer {}",
            patch.id,
            patch.patch.targets().join(", "),
            layer.name
        );
        for file in &patch.patch.files {
            deadline.check(&format!("apply layer {}", layer.name))?;
            apply_file(&mut staged, patch, file, layer, apply, deadline, &mut report)?;
        }
        report.applied.push(patch.id.clone());
    }

    report.changed = staged.changed_paths().into_iter().map(str::to_string).collect();
    tree.commit(staged)?;
    Ok(report)
}

fn conflict(patch: &PatchFile, hunk: String, reason: &str) -> Error {
    Error::PatchConflict {
        patch_id: patch.id.clone(),
        hunk,
        reason: reason.to_string(),
    }
}

fn apply_file(
    staged: &mut StagedTree<'_>,
    patch: &PatchFile,
    file: &FileDiff,
    layer: &PatchLayer,
    apply: ApplyConfig,
    deadline: Deadline,
    report: &mut LayerReport,
) -> Result<()> {
    let target = file.target();
    let source = file.source();

    for path in [source, target] {
        if !is_contained(path) {
            return Err(conflict(patch, path.to_string(), "path escapes the tree"));
        }
    }
    if is_excluded(target, &layer.excludes)? || is_excluded(source, &layer.excludes)? {
        debug!("{}: skipping excluded path {}", patch.id, target);
        report.skipped.push(target.to_string());
        return Ok(());
    }
    if file.binary {
        return Err(conflict(patch, target.to_string(), "binary patch"));
    }

    let operation = file.operation();
    let existing = match operation {
        FileOperation::Create => match staged.read(target)? {
            Some(content) if !content.is_empty() => {
                return Err(conflict(patch, target.to_string(), "file to create already exists"));
            }
            _ => Vec::new(),
        },
        _ => staged.read(source)?.ok_or_else(|| {
            conflict(
                patch,
                source.to_string(),
                &format!("file to {} does not exist", operation_verb(operation)),
            )
        })?,
    };

    let text = as_text(&patch.id, source, existing)?;
    let (patched, fuzzy) = apply_hunks(&patch.id, target, &text, &file.hunks, apply, deadline)?;
    if fuzzy > 0 {
        warn!(
            "{}: {} hunk(s) in {} applied with offset or fuzz",
            patch.id, fuzzy, target
        );
        report.fuzzy_hunks += fuzzy;
    }

    match operation {
        FileOperation::Delete => staged.remove(source),
        FileOperation::Rename => {
            staged.remove(source);
            staged.write(
                target,
                File {
                    content: patched.into_bytes(),
                    executable: file.executable(),
                },
            );
        }
        FileOperation::Create | FileOperation::Modify => staged.write(
            target,
            File {
                content: patched.into_bytes(),
                executable: file.executable(),
            },
        ),
    }
    Ok(())
}

fn operation_verb(operation: FileOperation) -> &'static str {
    match operation {
        FileOperation::Create => "create",
        FileOperation::Delete => "delete",
        FileOperation::Rename => "rename",
        FileOperation::Modify => "patch",
    }
}

fn as_text(patch_id: &str, path: &str, content: Vec<u8>) -> Result<String> {
    String::from_utf8(content).map_err(|_| Error::PatchConflict {
        patch_id: patch_id.to_string(),
        hunk: path.to_string(),
        reason: "target is not valid UTF-8".to_string(),
    })
}

/// A text file as lines plus its line-ending conventions
struct Lines {
    lines: Vec<String>,
    trailing_newline: bool,
    crlf: bool,
}

impl Lines {
    fn parse(text: &str) -> Self {
        let trailing_newline = text.is_empty() || text.ends_with('\n');
        let body = text.strip_suffix('\n').unwrap_or(text);
        let mut lines: Vec<String> = if text.is_empty() {
            Vec::new()
        } else {
            body.split('\n').map(str::to_string).collect()
        };
        let crlf = !lines.is_empty() && lines.iter().all(|l| l.ends_with('\r'));
        if crlf {
            for line in &mut lines {
                line.pop();
            }
        }
        Self {
            lines,
            trailing_newline,
            crlf,
        }
    }

    fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let eol = if self.crlf { "\r\n" } else { "\n" };
        let mut out = self.lines.join(eol);
        if self.trailing_newline {
            out.push_str(eol);
        }
        out
    }

    /// Compare ignoring a trailing `\r` on either side, so files with
    /// mixed line endings still match LF patches
    fn matches_at(&self, pos: usize, pattern: &[&str]) -> bool {
        pos + pattern.len() <= self.lines.len()
            && self.lines[pos..pos + pattern.len()]
                .iter()
                .zip(pattern)
                .all(|(have, want)| strip_cr(have) == strip_cr(want))
    }
}

fn strip_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

/// Where and how a hunk matched
struct Placement {
    pos: usize,
    offset: isize,
    top: usize,
    bottom: usize,
}

/// Apply `hunks` to `text`, returning the new text and the number of hunks
/// that needed an offset or fuzz
pub fn apply_hunks(
    patch_id: &str,
    path: &str,
    text: &str,
    hunks: &[Hunk],
    apply: ApplyConfig,
    deadline: Deadline,
) -> Result<(String, usize)> {
    let mut file = Lines::parse(text);
    let mut delta: isize = 0;
    let mut min_pos = 0usize;
    let mut fuzzy = 0;

    for (number, hunk) in hunks.iter().enumerate() {
        deadline.check(&format!("apply {} to {}", patch_id, path))?;

        let old = hunk.old_lines();
        let new = hunk.new_lines();
        let base = (if hunk.old_len == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        }) as isize;
        let expected = base + delta;

        let placement = find_placement(&file, hunk, &old, expected, min_pos, apply).ok_or_else(|| {
            Error::PatchConflict {
                patch_id: patch_id.to_string(),
                hunk: format!("{} {}", path, hunk),
                reason: format!(
                    "hunk #{} does not apply (searched {} lines either way with fuzz up to {})",
                    number + 1,
                    apply.max_offset,
                    apply.fuzz
                ),
            }
        })?;

        if placement.offset != 0 || placement.top > 0 || placement.bottom > 0 {
            debug!(
                "{}: hunk #{} of {} applied at offset {} with fuzz {}/{}",
                patch_id,
                number + 1,
                path,
                placement.offset,
                placement.top,
                placement.bottom
            );
            fuzzy += 1;
        }

        let removed = old.len() - placement.top - placement.bottom;
        let replacement = replacement_lines(&file, hunk, &placement, old.len(), new.len());
        let reaches_eof = placement.bottom == 0 && placement.pos + removed == file.lines.len();
        let inserted = replacement.len();
        file.lines
            .splice(placement.pos..placement.pos + removed, replacement);

        if reaches_eof && (hunk.old_no_newline || hunk.new_no_newline) {
            file.trailing_newline = !hunk.new_no_newline;
        }

        min_pos = placement.pos + inserted;
        let region_start = placement.pos as isize - placement.top as isize;
        delta = region_start + new.len() as isize - (base + old.len() as isize);
    }

    Ok((file.render(), fuzzy))
}

/// New-side lines for a placed hunk; context lines keep the file's own text
/// so their line endings survive
fn replacement_lines(
    file: &Lines,
    hunk: &Hunk,
    placement: &Placement,
    old_len: usize,
    new_len: usize,
) -> Vec<String> {
    let mut out = Vec::new();
    let (mut old_i, mut new_i) = (0usize, 0usize);
    for line in &hunk.lines {
        match line {
            HunkLine::Context(text) => {
                if new_i >= placement.top && new_i < new_len - placement.bottom {
                    let have = old_i
                        .checked_sub(placement.top)
                        .filter(|_| old_i < old_len - placement.bottom)
                        .and_then(|rel| file.lines.get(placement.pos + rel));
                    out.push(have.cloned().unwrap_or_else(|| text.clone()));
                }
                old_i += 1;
                new_i += 1;
            }
            HunkLine::Remove(_) => old_i += 1,
            HunkLine::Add(text) => {
                if new_i >= placement.top && new_i < new_len - placement.bottom {
                    out.push(text.clone());
                }
                new_i += 1;
            }
        }
    }
    out
}

fn find_placement(
    file: &Lines,
    hunk: &Hunk,
    old: &[&str],
    expected: isize,
    min_pos: usize,
    apply: ApplyConfig,
) -> Option<Placement> {
    let leading = hunk.leading_context();
    let trailing = hunk.trailing_context();
    let mut tried: Vec<(usize, usize)> = Vec::new();

    for fuzz in 0..=apply.fuzz {
        let top = fuzz.min(leading);
        let bottom = fuzz.min(trailing);
        // Fuzz may shrink a hunk but never strip it down to nothing
        if tried.contains(&(top, bottom)) || (!old.is_empty() && top + bottom >= old.len()) {
            continue;
        }
        tried.push((top, bottom));
        let pattern = &old[top..old.len() - bottom];
        let anchor = expected + top as isize;

        for step in 0..=apply.max_offset {
            let offsets: &[isize] = if step == 0 {
                &[0]
            } else {
                &[step as isize, -(step as isize)]
            };
            for offset in offsets {
                let pos = anchor + offset;
                if pos < min_pos as isize || pos > file.lines.len() as isize {
                    continue;
                }
                let pos = pos as usize;
                if file.matches_at(pos, pattern) {
                    return Some(Placement {
                        pos,
                        offset: *offset,
                        top,
                        bottom,
                    });
                }
            }
            // Both directions out of range: nothing further can match
            if anchor + (step as isize) > file.lines.len() as isize
                && anchor - (step as isize) < min_pos as isize
            {
                break;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff;
    use tempfile::TempDir;

    fn write(root: &std::path::Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn layer(patches: &[(&str, &str)], excludes: &[&str]) -> PatchLayer {
        PatchLayer {
            name: "api".to_string(),
            patches: patches
                .iter()
                .map(|(id, text)| PatchFile::from_text(id, text).unwrap())
                .collect(),
            excludes: excludes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn hunks(text: &str) -> Vec<Hunk> {
        diff::parse("t.patch", text).unwrap().files.remove(0).hunks
    }

    fn apply_text(text: &str, patch: &str) -> Result<(String, usize)> {
        apply_hunks(
            "t.patch",
            "f.txt",
            text,
            &hunks(patch),
            ApplyConfig::default(),
            Deadline::none(),
        )
    }

    const BASE: &str = "one\ntwo\nthree\nfour\nfive\nsix\nseven\n";

    const CHANGE_FOUR: &str = "\
--- a/f.txt
+++ b/f.txt
@@ -2,5 +2,5 @@
 two
 three
-four
+FOUR
 five
 six
";

    #[test]
    fn test_clean_apply() {
        let (out, fuzzy) = apply_text(BASE, CHANGE_FOUR).unwrap();
        assert_eq!(out, "one\ntwo\nthree\nFOUR\nfive\nsix\nseven\n");
        assert_eq!(fuzzy, 0);
    }

    #[test]
    fn test_apply_with_offset() {
        let shifted = format!("zero\nextra\n{}", BASE);
        let (out, fuzzy) = apply_text(&shifted, CHANGE_FOUR).unwrap();
        assert_eq!(out, "zero\nextra\none\ntwo\nthree\nFOUR\nfive\nsix\nseven\n");
        assert_eq!(fuzzy, 1);
    }

    #[test]
    fn test_apply_with_fuzz() {
        // Outermost context lines changed upstream
        let drifted = "one\nTWO\nthree\nfour\nfive\nSIX\nseven\n";
        let (out, fuzzy) = apply_text(drifted, CHANGE_FOUR).unwrap();
        assert_eq!(out, "one\nTWO\nthree\nFOUR\nfive\nSIX\nseven\n");
        assert_eq!(fuzzy, 1);
    }

    #[test]
    fn test_fuzz_disabled_rejects_drifted_context() {
        let drifted = "one\nTWO\nthree\nfour\nfive\nSIX\nseven\n";
        let strict = ApplyConfig {
            fuzz: 0,
            max_offset: 10,
        };
        let err = apply_hunks(
            "t.patch",
            "f.txt",
            drifted,
            &hunks(CHANGE_FOUR),
            strict,
            Deadline::none(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::PatchConflict { .. }));
    }

    #[test]
    fn test_offset_beyond_limit_conflicts() {
        let shifted = format!("a\nb\nc\nd\n{}", BASE);
        let tight = ApplyConfig {
            fuzz: 0,
            max_offset: 2,
        };
        let err = apply_hunks(
            "t.patch",
            "f.txt",
            &shifted,
            &hunks(CHANGE_FOUR),
            tight,
            Deadline::none(),
        )
        .unwrap_err();
        match err {
            Error::PatchConflict { patch_id, hunk, .. } => {
                assert_eq!(patch_id, "t.patch");
                assert_eq!(hunk, "f.txt @@ -2,5 +2,5 @@");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_removed_line_missing_conflicts() {
        let err = apply_text("one\ntwo\nthree\n4\nfive\nsix\nseven\n", CHANGE_FOUR).unwrap_err();
        assert!(matches!(err, Error::PatchConflict { .. }));
    }

    #[test]
    fn test_multiple_hunks_carry_drift() {
        let patch = "\
--- a/f.txt
+++ b/f.txt
@@ -1,2 +1,3 @@
 one
+one-and-a-half
 two
@@ -6,2 +7,2 @@
 six
-seven
+SEVEN
";
        let (out, _) = apply_text(BASE, patch).unwrap();
        assert_eq!(out, "one\none-and-a-half\ntwo\nthree\nfour\nfive\nsix\nSEVEN\n");
    }

    #[test]
    fn test_no_newline_markers() {
        let patch = "\
--- a/f.txt
+++ b/f.txt
@@ -1,2 +1,2 @@
 a
-b
\\ No newline at end of file
+c
";
        let (out, _) = apply_text("a\nb", patch).unwrap();
        assert_eq!(out, "a\nc\n");

        let patch = "\
--- a/f.txt
+++ b/f.txt
@@ -1,2 +1,2 @@
 a
-b
+c
\\ No newline at end of file
";
        let (out, _) = apply_text("a\nb\n", patch).unwrap();
        assert_eq!(out, "a\nc");
    }

    #[test]
    fn test_crlf_files_keep_line_endings() {
        let (out, _) = apply_text(&BASE.replace('\n', "\r\n"), CHANGE_FOUR).unwrap();
        assert_eq!(out, "one\r\ntwo\r\nthree\r\nFOUR\r\nfive\r\nsix\r\nseven\r\n");
    }

    #[test]
    fn test_mixed_line_endings_still_match() {
        let mixed = "one\r\ntwo\nthree\r\nfour\nfive\r\nsix\nseven\n";
        let (out, fuzzy) = apply_text(mixed, CHANGE_FOUR).unwrap();
        assert_eq!(out, "one\r\ntwo\nthree\r\nFOUR\nfive\r\nsix\nseven\n");
        assert_eq!(fuzzy, 0);
    }

    #[test]
    fn test_fuzz_never_drops_all_context() {
        // Pure insertion whose two context lines exist nowhere in the file
        let patch = "--- a/f.txt\n+++ b/f.txt\n@@ -1,2 +1,3 @@\n x\n+new\n y\n";
        let err = apply_text("a\nb\nc\n", patch).unwrap_err();
        assert!(matches!(err, Error::PatchConflict { .. }));

        let wide = ApplyConfig {
            fuzz: 5,
            max_offset: 100,
        };
        let err = apply_hunks("t.patch", "f.txt", "a\nb\nc\n", &hunks(patch), wide, Deadline::none())
            .unwrap_err();
        assert!(matches!(err, Error::PatchConflict { .. }));
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let deadline = Deadline::after(Some(Duration::ZERO));
        let err = apply_hunks(
            "t.patch",
            "f.txt",
            BASE,
            &hunks(CHANGE_FOUR),
            ApplyConfig::default(),
            deadline,
        )
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_empty_layer_is_identity() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "src/A.java", "class A {}\n");
        write(temp.path(), "README.md", "readme\n");
        let tree = WorkingTree::new(temp.path());
        let before = tree.fingerprint().unwrap();

        let report = apply_layer(&tree, &layer(&[], &[]), ApplyConfig::default(), Deadline::none())
            .unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(tree.fingerprint().unwrap(), before);
    }

    #[test]
    fn test_reapply_is_byte_identical() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        for temp in [&first, &second] {
            write(temp.path(), "f.txt", BASE);
        }
        let patches = layer(&[("0001-four.patch", CHANGE_FOUR)], &[]);

        let a = WorkingTree::new(first.path());
        let b = WorkingTree::new(second.path());
        apply_layer(&a, &patches, ApplyConfig::default(), Deadline::none()).unwrap();
        apply_layer(&b, &patches, ApplyConfig::default(), Deadline::none()).unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_conflict_in_second_patch_rolls_back_layer() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "f.txt", BASE);
        write(temp.path(), "g.txt", "alpha\nbeta\n");
        let tree = WorkingTree::new(temp.path());
        let before = tree.fingerprint().unwrap();

        let p2 = "\
--- a/g.txt
+++ b/g.txt
@@ -1,2 +1,2 @@
 alpha
-gamma
+delta
";
        let patches = layer(&[("p1.patch", CHANGE_FOUR), ("p2.patch", p2)], &[]);
        let err = apply_layer(&tree, &patches, ApplyConfig::default(), Deadline::none())
            .unwrap_err();

        match err {
            Error::PatchConflict { patch_id, hunk, .. } => {
                assert_eq!(patch_id, "p2.patch");
                assert!(hunk.starts_with("g.txt @@ -1,2 +1,2 @@"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        // p1 applied cleanly in memory but nothing reached the disk
        assert_eq!(tree.fingerprint().unwrap(), before);
        assert_eq!(fs::read_to_string(temp.path().join("f.txt")).unwrap(), BASE);
    }

    #[test]
    fn test_excluded_targets_are_skipped() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "f.txt", BASE);
        write(temp.path(), "build.gradle.kts", "ours\n");
        let tree = WorkingTree::new(temp.path());

        let gradle = "\
--- a/build.gradle.kts
+++ b/build.gradle.kts
@@ -1 +1 @@
-theirs
+patched
";
        let patches = layer(
            &[("0001.patch", gradle), ("0002.patch", CHANGE_FOUR)],
            &["build.gradle.kts"],
        );
        let report = apply_layer(&tree, &patches, ApplyConfig::default(), Deadline::none()).unwrap();

        assert_eq!(report.skipped, vec!["build.gradle.kts"]);
        assert_eq!(
            fs::read_to_string(temp.path().join("build.gradle.kts")).unwrap(),
            "ours\n"
        );
        assert!(fs::read_to_string(temp.path().join("f.txt"))
            .unwrap()
            .contains("FOUR"));
    }

    #[test]
    fn test_create_delete_and_rename() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "old/Name.java", "class Name {}\n");
        write(temp.path(), "gone.txt", "bye\n");
        let tree = WorkingTree::new(temp.path());

        let patch = "\
diff --git a/new/File.java b/new/File.java
new file mode 100644
index 0000000..1111111
--- /dev/null
+++ b/new/File.java
@@ -0,0 +1,2 @@
+class File {
+}
diff --git a/gone.txt b/gone.txt
deleted file mode 100644
index 2222222..0000000
--- a/gone.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
diff --git a/old/Name.java b/renamed/Name.java
similarity index 90%
rename from old/Name.java
rename to renamed/Name.java
--- a/old/Name.java
+++ b/renamed/Name.java
@@ -1 +1 @@
-class Name {}
+class Name { }
";
        let report = apply_layer(&tree, &layer(&[("0001.patch", patch)], &[]), ApplyConfig::default(), Deadline::none())
            .unwrap();

        assert_eq!(
            report.changed,
            vec!["gone.txt", "new/File.java", "old/Name.java", "renamed/Name.java"]
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("new/File.java")).unwrap(),
            "class File {\n}\n"
        );
        assert!(!temp.path().join("gone.txt").exists());
        assert!(!temp.path().join("old/Name.java").exists());
        assert_eq!(
            fs::read_to_string(temp.path().join("renamed/Name.java")).unwrap(),
            "class Name { }\n"
        );
    }

    #[test]
    fn test_create_over_existing_file_conflicts() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "already here\n");
        let tree = WorkingTree::new(temp.path());
        let patch = "--- /dev/null\n+++ b/a.txt\n@@ -0,0 +1 @@\n+new\n";

        let err = apply_layer(&tree, &layer(&[("c.patch", patch)], &[]), ApplyConfig::default(), Deadline::none())
            .unwrap_err();
        assert!(matches!(err, Error::PatchConflict { ref reason, .. } if reason.contains("already exists")));
    }

    #[test]
    fn test_paths_outside_tree_rejected() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tree");
        write(&root, "f.txt", BASE);
        write(temp.path(), "victim.txt", "untouched\n");
        let tree = WorkingTree::new(&root);

        let escapes = [
            "--- /dev/null\n+++ b/../escaped.txt\n@@ -0,0 +1 @@\n+owned\n",
            "--- a/../victim.txt\n+++ b/../victim.txt\n@@ -1 +1 @@\n-untouched\n+owned\n",
            "--- a/f.txt\n+++ b/../../moved.txt\n@@ -1 +1 @@\n-one\n+1\n",
        ];
        for text in escapes {
            let err = apply_layer(&tree, &layer(&[("evil.patch", text)], &[]), ApplyConfig::default(), Deadline::none())
                .unwrap_err();
            assert!(
                matches!(err, Error::PatchConflict { ref reason, .. } if reason == "path escapes the tree"),
                "{}: {:?}",
                text,
                err
            );
        }

        assert!(!temp.path().join("escaped.txt").exists());
        assert_eq!(fs::read_to_string(temp.path().join("victim.txt")).unwrap(), "untouched\n");
        assert_eq!(fs::read_to_string(root.join("f.txt")).unwrap(), BASE);
    }

    #[test]
    fn test_absolute_patch_path_rejected() {
        let temp = TempDir::new().unwrap();
        let tree = WorkingTree::new(temp.path());
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("abs.txt");
        let text = format!("--- /dev/null\n+++ {}\n@@ -0,0 +1 @@\n+owned\n", target.display());

        let err = apply_layer(&tree, &layer(&[("abs.patch", text.as_str())], &[]), ApplyConfig::default(), Deadline::none())
            .unwrap_err();
        assert!(matches!(err, Error::PatchConflict { .. }));
        assert!(!target.exists());
    }

    #[test]
    fn test_cancel_between_layers_stops_before_next_layer() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, "upstream/f.txt", BASE);
        write(root, "patches/api/0001-four.patch", CHANGE_FOUR);
        write(
            root,
            ".patchstack.yaml",
            r#"
upstreams:
  - { name: core, repo: mem://core, ref: main }
layers:
  - { name: api, source: core, patches_dir: patches/api, output_dir: out/api }
  - { name: server, source: api, patches_dir: patches/server, output_dir: out/server }
"#,
        );
        let config = crate::config::from_file(root.join(".patchstack.yaml")).unwrap();
        let plan = crate::phases::resolve::execute(&config).unwrap();
        let upstreams = HashMap::from([(
            "core".to_string(),
            Materialized {
                tree: WorkingTree::new(root.join("upstream")),
                resolved: "0".repeat(40),
                cache_hit: true,
            },
        )]);
        let store = PatchStore::new(root);
        let state = StateDir::for_config(&config);
        let cancel = CancelToken::new();
        let ctx = PatchContext {
            config: &config,
            store: &store,
            upstreams: &upstreams,
            state: &state,
            timeout: None,
            cancel: &cancel,
        };

        let steps: Vec<String> = plan.entries.iter().map(|e| e.step.to_string()).collect();
        assert_eq!(steps, vec!["fetch core", "apply api", "apply server"]);
        assert!(run_entry(&plan.entries[0], &ctx).unwrap().is_none());
        assert!(run_entry(&plan.entries[1], &ctx).unwrap().is_some());

        cancel.cancel();
        let err = run_entry(&plan.entries[2], &ctx).err().unwrap();
        assert!(matches!(err, Error::Cancelled { ref stage } if stage == "patch"));

        assert!(fs::read_to_string(root.join("out/api/f.txt")).unwrap().contains("FOUR"));
        assert!(state.read_stamp("api").unwrap().is_some());
        assert!(!root.join("out/server").exists());
        assert!(state.read_stamp("server").unwrap().is_none());
    }

    #[test]
    fn test_binary_patch_rejected() {
        let temp = TempDir::new().unwrap();
        let tree = WorkingTree::new(temp.path());
        let patch = "\
diff --git a/logo.png b/logo.png
index 1111111..2222222 100644
Binary files a/logo.png and b/logo.png differ
";
        let err = apply_layer(&tree, &layer(&[("bin.patch", patch)], &[]), ApplyConfig::default(), Deadline::none())
            .unwrap_err();
        assert!(matches!(err, Error::PatchConflict { ref reason, .. } if reason == "binary patch"));
    }

    #[test]
    fn test_later_patch_sees_earlier_edits() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "f.txt", BASE);
        let tree = WorkingTree::new(temp.path());
        let second = "\
--- a/f.txt
+++ b/f.txt
@@ -3,3 +3,3 @@
 three
-FOUR
+Four
 five
";
        apply_layer(
            &tree,
            &layer(&[("0001.patch", CHANGE_FOUR), ("0002.patch", second)], &[]),
            ApplyConfig::default(),
            Deadline::none(),
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(temp.path().join("f.txt")).unwrap(),
            "one\ntwo\nthree\nFour\nfive\nsix\nseven\n"
        );
    }
}
