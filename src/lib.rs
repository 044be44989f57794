//! Black-box conformance suite for OpenStack-style compute APIs.
//!
//! The suite provisions real servers and images through the compute API,
//! polls them with a [`StatusWaiter`], logs into them over a
//! [`RemoteSession`] to verify what the API claims, and releases everything
//! it created. Scenarios live in [`scenario`]; [`runner::SuiteRunner`]
//! executes them sequentially and produces a [`runner::SuiteReport`].

pub mod compute;
pub mod config;
pub mod handle;
pub mod known_issues;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod test_support;
pub mod wait;

pub use compute::{ApiRequest, ApiResponse, ComputeApi, ComputeError, NovaClient};
pub use config::{ComputeConfig, ConfigError, EnvironmentConfig, SshConfig, SuiteConfig};
pub use handle::ResourceHandle;
pub use known_issues::{KnownIssue, KnownIssues};
pub use runner::{ScenarioOutcome, ScenarioResult, SuiteReport, SuiteRunner};
pub use scenario::{
    Requirement, ResourceLedger, ScenarioCase, ScenarioError, SuiteContext, all_scenarios,
};
pub use session::{
    RemoteCommand, RemoteSession, SessionCredential, SessionError, SshTransport, Transport,
};
pub use wait::{StatusSource, StatusWaiter, WaitError, WaitOutcome};
