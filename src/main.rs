//! # patchstack CLI
//!
//! This is the binary entry point for the `patchstack` command-line tool.
//!
//! Its primary responsibilities are:
//! - Parsing command-line arguments using `clap`.
//! - Executing the appropriate command based on the parsed arguments.
//! - Handling top-level errors. A failed build surfaces as
//!   `failed at stage <stage>` with exit code 1; usage errors exit with 2.
//!
//! The core logic lives in the `patchstack` library crate; the binary is a
//! thin wrapper around it.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    cli.execute()
}
