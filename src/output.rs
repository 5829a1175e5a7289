//! # Terminal Output
//!
//! Decides whether the CLI decorates its output with emoji and colors, and
//! formats the status markers the commands print in front of each line.
//!
//! Colors are controlled by `--color=always|never|auto`. In `auto` mode the
//! usual environment conventions apply: `NO_COLOR`, `CLICOLOR=0` and
//! `TERM=dumb` turn decoration off, `CLICOLOR_FORCE=1` turns it on, and
//! otherwise stdout must be a color-capable terminal.
//!
//! ```rust
//! use patchstack::output::{emoji, OutputConfig};
//!
//! let out = OutputConfig::from_env_and_flag("never");
//! assert_eq!(emoji(&out, "📋", "[PLAN]"), "[PLAN]");
//! ```

use std::env;

use console::style;

/// Whether output is decorated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub use_color: bool,
}

impl OutputConfig {
    /// Build from the `--color` flag value, falling back to environment
    /// detection for anything other than `always` or `never`
    pub fn from_env_and_flag(color_flag: &str) -> Self {
        let use_color = match color_flag.to_ascii_lowercase().as_str() {
            "always" => true,
            "never" => false,
            _ => detect_color_support(),
        };
        Self { use_color }
    }

    #[cfg(test)]
    pub fn with_color() -> Self {
        Self { use_color: true }
    }

    #[cfg(test)]
    pub fn without_color() -> Self {
        Self { use_color: false }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self::from_env_and_flag("auto")
    }
}

fn detect_color_support() -> bool {
    if env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if env::var("CLICOLOR").is_ok_and(|v| v == "0") {
        return false;
    }
    if env::var("CLICOLOR_FORCE").is_ok_and(|v| !v.is_empty() && v != "0") {
        return true;
    }
    if env::var("TERM").is_ok_and(|v| v == "dumb") {
        return false;
    }
    console::Term::stdout().features().colors_supported()
}

/// The emoji when decorating, the bracketed plain marker otherwise
pub fn emoji<'a>(config: &OutputConfig, emoji_str: &'a str, plain: &'a str) -> &'a str {
    if config.use_color {
        emoji_str
    } else {
        plain
    }
}

/// Render a stage name (`resolve`, `patch`, ...) in bold when decorating
pub fn stage_name(config: &OutputConfig, stage: &str) -> String {
    if config.use_color {
        style(stage).bold().to_string()
    } else {
        stage.to_string()
    }
}
