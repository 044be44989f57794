//! Binary entry point for the `stacktester` CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use stacktester::{
    ComputeError, ConfigError, KnownIssue, NovaClient, Requirement, SshTransport, SuiteConfig,
    SuiteContext, SuiteRunner, all_scenarios,
};

mod cli;

use cli::{Cli, RunCommand};

/// Exit status for failures that prevent the suite from starting.
const SETUP_FAILURE: i32 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("compute client error: {0}")]
    Compute(#[from] ComputeError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            SETUP_FAILURE
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_suite(command).await,
        Cli::List => {
            list_scenarios(io::stdout().lock())?;
            Ok(0)
        }
    }
}

async fn run_suite(args: RunCommand) -> Result<i32, CliError> {
    let config = SuiteConfig::load_without_cli_args()?;
    let api = NovaClient::new(&config.compute)?;
    let transport = SshTransport::new(config.ssh.ssh_options());
    let context = SuiteContext::new(api, transport, config)?;

    let runner = SuiteRunner::new(context, all_scenarios());
    let selected = match args.filter {
        Some(pattern) => runner.with_filter(pattern),
        None => runner,
    };
    let report = selected.run().await;

    writeln!(io::stdout().lock(), "{report}")?;
    Ok(report.exit_code())
}

fn list_scenarios(mut target: impl Write) -> io::Result<()> {
    for case in all_scenarios::<NovaClient, SshTransport>() {
        let note = match case.requirement {
            Requirement::MultiNode => " [multi-node]",
            Requirement::None => "",
        };
        writeln!(target, "{:<40} {}{note}", case.name, case.summary)?;
    }
    writeln!(target)?;
    writeln!(target, "Known issues (list fixed ones in fixed_issues for strict checks):")?;
    for issue in KnownIssue::ALL {
        writeln!(target, "  {:<38} {}", issue.id(), issue.description())?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
