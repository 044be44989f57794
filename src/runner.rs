//! Sequential scenario execution and reporting.
//!
//! The runner owns the [`SuiteContext`] and a list of cases. Each selected
//! case runs with a fresh [`ResourceLedger`] which is always released
//! afterwards, so a failing scenario never leaks servers or images into the
//! next one.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::compute::ComputeApi;
use crate::scenario::{ResourceLedger, ScenarioCase, SuiteContext, SuiteTransport, TeardownError};

/// How one scenario ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScenarioOutcome {
    /// Every check held and teardown succeeded.
    Passed,
    /// The system under test misbehaved.
    Failed(String),
    /// The check could not be completed, or teardown failed.
    Errored(String),
    /// The deployment lacks a capability the scenario needs.
    Skipped(String),
}

impl ScenarioOutcome {
    /// Short label used in reports.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::Failed(_) => "FAIL",
            Self::Errored(_) => "ERROR",
            Self::Skipped(_) => "SKIP",
        }
    }

    /// Detail message, if any.
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Passed => None,
            Self::Failed(message) | Self::Errored(message) | Self::Skipped(message) => {
                Some(message)
            }
        }
    }
}

/// Result of one scenario.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScenarioResult {
    /// Scenario name.
    pub name: &'static str,
    /// How it ended.
    pub outcome: ScenarioOutcome,
    /// Time spent, teardown included.
    pub elapsed: Duration,
}

/// Results of a whole suite run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SuiteReport {
    results: Vec<ScenarioResult>,
}

impl SuiteReport {
    /// Results in execution order.
    #[must_use]
    pub fn results(&self) -> &[ScenarioResult] {
        &self.results
    }

    fn count(&self, label: &str) -> usize {
        self.results
            .iter()
            .filter(|result| result.outcome.label() == label)
            .count()
    }

    /// Number of passed scenarios.
    #[must_use]
    pub fn passed(&self) -> usize {
        self.count("PASS")
    }

    /// Number of failed scenarios.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count("FAIL")
    }

    /// Number of errored scenarios.
    #[must_use]
    pub fn errored(&self) -> usize {
        self.count("ERROR")
    }

    /// Number of skipped scenarios.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count("SKIP")
    }

    /// Process exit code: zero when nothing failed or errored.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.failed() == 0 && self.errored() == 0 {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            write!(
                f,
                "{:<5} {} ({}ms)",
                result.outcome.label(),
                result.name,
                result.elapsed.as_millis()
            )?;
            if let Some(detail) = result.outcome.detail() {
                write!(f, ": {detail}")?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "{} passed, {} failed, {} errored, {} skipped",
            self.passed(),
            self.failed(),
            self.errored(),
            self.skipped()
        )
    }
}

fn append_teardown_note(message: String, teardown: Option<&TeardownError>) -> String {
    if let Some(failure) = teardown {
        format!("{message} (teardown also failed: {failure})")
    } else {
        message
    }
}

/// Runs scenarios one at a time against a shared context.
#[derive(Debug)]
pub struct SuiteRunner<A, T> {
    context: SuiteContext<A, T>,
    cases: Vec<ScenarioCase<A, T>>,
    filter: Option<String>,
}

impl<A, T> SuiteRunner<A, T>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    /// Creates a runner for `cases`.
    #[must_use]
    pub const fn new(context: SuiteContext<A, T>, cases: Vec<ScenarioCase<A, T>>) -> Self {
        Self {
            context,
            cases,
            filter: None,
        }
    }

    /// Restricts the run to scenarios whose name contains `pattern`.
    #[must_use]
    pub fn with_filter(mut self, pattern: impl Into<String>) -> Self {
        self.filter = Some(pattern.into());
        self
    }

    /// Shared context.
    #[must_use]
    pub const fn context(&self) -> &SuiteContext<A, T> {
        &self.context
    }

    /// Cases the filter selects, in execution order.
    pub fn selected(&self) -> impl Iterator<Item = &ScenarioCase<A, T>> {
        self.cases.iter().filter(|case| {
            self.filter
                .as_deref()
                .is_none_or(|pattern| case.name.contains(pattern))
        })
    }

    /// Runs every selected scenario sequentially.
    pub async fn run(&self) -> SuiteReport {
        let mut results = Vec::new();
        for case in self.selected() {
            let result = self.run_case(case).await;
            match &result.outcome {
                ScenarioOutcome::Passed => info!(scenario = result.name, "passed"),
                ScenarioOutcome::Skipped(reason) => info!(scenario = result.name, %reason, "skipped"),
                ScenarioOutcome::Failed(message) => {
                    warn!(scenario = result.name, %message, "failed");
                }
                ScenarioOutcome::Errored(message) => {
                    error!(scenario = result.name, %message, "errored");
                }
            }
            results.push(result);
        }
        SuiteReport { results }
    }

    /// Runs one scenario and releases everything it recorded.
    pub async fn run_case(&self, case: &ScenarioCase<A, T>) -> ScenarioResult {
        let started = Instant::now();
        if let Some(reason) = case.skip_reason(self.context.config()) {
            return ScenarioResult {
                name: case.name,
                outcome: ScenarioOutcome::Skipped(reason.to_owned()),
                elapsed: started.elapsed(),
            };
        }

        info!(scenario = case.name, summary = case.summary, "running");
        let mut ledger = ResourceLedger::new();
        let body = (case.body)(&self.context, &mut ledger).await;
        let teardown = ledger.release(self.context.api()).await.err();

        let outcome = match body {
            Ok(()) => teardown.map_or(ScenarioOutcome::Passed, |failure| {
                ScenarioOutcome::Errored(format!("teardown failed: {failure}"))
            }),
            Err(err) => {
                let message = append_teardown_note(err.to_string(), teardown.as_ref());
                if err.is_failure() {
                    ScenarioOutcome::Failed(message)
                } else {
                    ScenarioOutcome::Errored(message)
                }
            }
        };
        ScenarioResult {
            name: case.name,
            outcome,
            elapsed: started.elapsed(),
        }
    }
}
