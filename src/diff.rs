//! Unified diff parsing
//!
//! Understands plain `diff -u` output as well as `git diff` and
//! `git format-patch` files: mbox preambles and commit messages are skipped,
//! `diff --git` extended headers (new/deleted file, mode changes, renames)
//! are honoured, and `\ No newline at end of file` markers are attached to
//! the side they belong to.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::path::strip_diff_prefix;

/// One line of a hunk body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

/// A single `@@` hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based first line on the old side (0 for an empty old side)
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    /// Text after the closing `@@`, usually the enclosing function
    pub section: String,
    pub lines: Vec<HunkLine>,
    /// The old side's last line has no trailing newline
    pub old_no_newline: bool,
    /// The new side's last line has no trailing newline
    pub new_no_newline: bool,
}

impl Hunk {
    /// Lines the hunk expects to find (context and removals)
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines the hunk produces (context and additions)
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }

    /// Number of context lines before the first change
    pub fn leading_context(&self) -> usize {
        self.lines
            .iter()
            .take_while(|l| matches!(l, HunkLine::Context(_)))
            .count()
    }

    /// Number of context lines after the last change
    pub fn trailing_context(&self) -> usize {
        self.lines
            .iter()
            .rev()
            .take_while(|l| matches!(l, HunkLine::Context(_)))
            .count()
    }
}

impl fmt::Display for Hunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_len, self.new_start, self.new_len
        )
    }
}

/// What a file diff does to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Modify,
    Create,
    Delete,
    Rename,
}

/// All hunks touching one file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileDiff {
    /// Path before the change, `None` for `/dev/null`
    pub old_path: Option<String>,
    /// Path after the change, `None` for `/dev/null`
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
    /// Mode from `new file mode` / `new mode`
    pub new_mode: Option<u32>,
    pub created: bool,
    pub deleted: bool,
    pub binary: bool,
}

impl FileDiff {
    pub fn operation(&self) -> FileOperation {
        if self.created || (self.old_path.is_none() && self.new_path.is_some()) {
            FileOperation::Create
        } else if self.deleted || (self.new_path.is_none() && self.old_path.is_some()) {
            FileOperation::Delete
        } else if self.old_path != self.new_path {
            FileOperation::Rename
        } else {
            FileOperation::Modify
        }
    }

    /// The path this diff writes (or deletes, for deletions)
    pub fn target(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    /// The path this diff reads from
    pub fn source(&self) -> &str {
        self.old_path
            .as_deref()
            .or(self.new_path.as_deref())
            .unwrap_or_default()
    }

    /// Whether the new mode sets the executable bit
    pub fn executable(&self) -> Option<bool> {
        self.new_mode.map(|mode| mode & 0o111 != 0)
    }
}

/// A parsed patch file, possibly touching several files
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchSet {
    pub files: Vec<FileDiff>,
}

impl PatchSet {
    /// Every path the patch touches, in order of appearance
    pub fn targets(&self) -> Vec<&str> {
        self.files.iter().map(FileDiff::target).collect()
    }
}

fn hunk_header() -> Result<&'static Regex> {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    if let Some(regex) = HEADER.get() {
        return Ok(regex);
    }
    let regex = Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@ ?(.*)$")?;
    Ok(HEADER.get_or_init(|| regex))
}

fn malformed(patch_id: &str, line_no: usize, reason: String) -> Error {
    Error::PatchConflict {
        patch_id: patch_id.to_string(),
        hunk: format!("line {}", line_no),
        reason: format!("malformed patch: {}", reason),
    }
}

/// Parse the text of a patch file
///
/// `patch_id` only labels errors.
pub fn parse(patch_id: &str, text: &str) -> Result<PatchSet> {
    let lines: Vec<&str> = text.split('\n').collect();
    // `split` yields a final empty piece for newline-terminated text
    let line_count = if text.ends_with('\n') {
        lines.len() - 1
    } else {
        lines.len()
    };

    let mut files: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;
    let mut i = 0;

    while i < line_count {
        let line = lines[i].strip_suffix('\r').unwrap_or(lines[i]);

        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(done) = current.take() {
                files.push(done);
            }
            let (old, new) = split_git_paths(rest);
            current = Some(FileDiff {
                old_path: old,
                new_path: new,
                ..FileDiff::default()
            });
        } else if let Some(file) = current.as_mut().filter(|f| f.hunks.is_empty()) {
            if let Some(mode) = line.strip_prefix("new file mode ") {
                file.created = true;
                file.new_mode = u32::from_str_radix(mode.trim(), 8).ok();
            } else if line.starts_with("deleted file mode ") {
                file.deleted = true;
            } else if let Some(mode) = line.strip_prefix("new mode ") {
                file.new_mode = u32::from_str_radix(mode.trim(), 8).ok();
            } else if let Some(from) = line.strip_prefix("rename from ") {
                file.old_path = Some(from.to_string());
            } else if let Some(to) = line.strip_prefix("rename to ") {
                file.new_path = Some(to.to_string());
            } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
                file.binary = true;
            }
        }

        if let Some(old) = line.strip_prefix("--- ") {
            let next = lines
                .get(i + 1)
                .filter(|_| i + 1 < line_count)
                .map(|l| l.strip_suffix('\r').unwrap_or(*l));
            if let Some(new) = next.and_then(|l| l.strip_prefix("+++ ")) {
                // A `---` without a preceding `diff --git` (or after one that
                // already has hunks) starts a new plain unified diff
                let starts_new = current.as_ref().map_or(true, |f| !f.hunks.is_empty());
                if starts_new {
                    if let Some(done) = current.take() {
                        files.push(done);
                    }
                    current = Some(FileDiff::default());
                }
                if let Some(file) = current.as_mut() {
                    file.old_path = strip_diff_prefix(old);
                    file.new_path = strip_diff_prefix(new);
                }
                i += 2;
                continue;
            }
        }

        if line.starts_with("@@ ") {
            let file = current
                .as_mut()
                .ok_or_else(|| malformed(patch_id, i + 1, "hunk before any file header".to_string()))?;
            let (hunk, consumed) = parse_hunk(patch_id, &lines[..line_count], i)?;
            file.hunks.push(hunk);
            i += consumed;
            continue;
        }

        i += 1;
    }

    if let Some(done) = current.take() {
        files.push(done);
    }
    files.retain(|f| f.old_path.is_some() || f.new_path.is_some());

    Ok(PatchSet { files })
}

/// Split `a/foo b/foo` from a `diff --git` line
fn split_git_paths(rest: &str) -> (Option<String>, Option<String>) {
    if let Some(idx) = rest.find(" b/") {
        let old = &rest[..idx];
        let new = &rest[idx + 1..];
        (strip_diff_prefix(old), strip_diff_prefix(new))
    } else {
        let mut parts = rest.splitn(2, ' ');
        let old = parts.next().and_then(strip_diff_prefix);
        let new = parts.next().and_then(strip_diff_prefix);
        (old, new)
    }
}

/// Parse one hunk starting at `start`; returns it with the number of lines
/// consumed
fn parse_hunk(patch_id: &str, lines: &[&str], start: usize) -> Result<(Hunk, usize)> {
    let header = lines[start].strip_suffix('\r').unwrap_or(lines[start]);
    let caps = hunk_header()?
        .captures(header)
        .ok_or_else(|| malformed(patch_id, start + 1, format!("bad hunk header '{}'", header)))?;
    let number = |idx: usize, default: usize| -> Result<usize> {
        match caps.get(idx) {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|_| malformed(patch_id, start + 1, format!("bad number in '{}'", header))),
            None => Ok(default),
        }
    };

    let mut hunk = Hunk {
        old_start: number(1, 0)?,
        old_len: number(2, 1)?,
        new_start: number(3, 0)?,
        new_len: number(4, 1)?,
        section: caps.get(5).map(|m| m.as_str().to_string()).unwrap_or_default(),
        lines: Vec::new(),
        old_no_newline: false,
        new_no_newline: false,
    };

    let mut old_left = hunk.old_len;
    let mut new_left = hunk.new_len;
    let mut i = start + 1;

    while old_left > 0 || new_left > 0 {
        let Some(raw) = lines.get(i) else {
            return Err(malformed(
                patch_id,
                i,
                format!("hunk {} ends early", hunk),
            ));
        };
        let raw = raw.strip_suffix('\r').unwrap_or(*raw);
        let (kind, body) = match raw.chars().next() {
            Some(c) => (c, &raw[c.len_utf8()..]),
            // Editors sometimes strip the single space of an empty context line
            None => (' ', ""),
        };
        match kind {
            ' ' if old_left > 0 && new_left > 0 => {
                hunk.lines.push(HunkLine::Context(body.to_string()));
                old_left -= 1;
                new_left -= 1;
            }
            '-' if old_left > 0 => {
                hunk.lines.push(HunkLine::Remove(body.to_string()));
                old_left -= 1;
            }
            '+' if new_left > 0 => {
                hunk.lines.push(HunkLine::Add(body.to_string()));
                new_left -= 1;
            }
            '\\' => mark_no_newline(&mut hunk),
            _ => {
                return Err(malformed(
                    patch_id,
                    i + 1,
                    format!("unexpected line in hunk {}: '{}'", hunk, raw),
                ))
            }
        }
        i += 1;
    }

    // A trailing marker belongs to the hunk's last line
    if lines.get(i).is_some_and(|l| l.starts_with('\\')) {
        mark_no_newline(&mut hunk);
        i += 1;
    }

    Ok((hunk, i - start))
}

fn mark_no_newline(hunk: &mut Hunk) {
    match hunk.lines.last() {
        Some(HunkLine::Remove(_)) => hunk.old_no_newline = true,
        Some(HunkLine::Add(_)) => hunk.new_no_newline = true,
        Some(HunkLine::Context(_)) => {
            hunk.old_no_newline = true;
            hunk.new_no_newline = true;
        }
        None => {}
    }
}
