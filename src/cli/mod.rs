//! Command-line interface definitions for the `stacktester` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `stacktester` binary.
#[derive(Debug, Parser)]
#[command(
    name = "stacktester",
    about = "Run black-box conformance scenarios against a compute API",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run the conformance scenarios and report the results.
    #[command(name = "run", about = "Run the conformance scenarios")]
    Run(RunCommand),
    /// List scenario names without contacting the deployment.
    #[command(name = "list", about = "List the scenarios the suite contains")]
    List,
}

/// Arguments for the `stacktester run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Only run scenarios whose name contains this text, for example
    /// `images::` or `rebuild`.
    #[arg(long, value_name = "PATTERN")]
    pub(crate) filter: Option<String>,
}
