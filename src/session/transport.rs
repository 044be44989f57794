//! Transport abstraction underneath [`super::RemoteSession`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use super::SessionCredential;
use super::command::RemoteCommand;

/// Result of running a command on the remote host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the remote command, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// How a held connection ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HoldOutcome {
    /// The connection was open and then closed by the remote side.
    Dropped,
    /// No connection could be opened; the endpoint is already down.
    Unreachable,
    /// The connection was still open when the time limit elapsed.
    StillOpen,
}

/// Failures reported by a [`Transport`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The endpoint did not accept a connection.
    #[error("endpoint unreachable: {message}")]
    Unreachable {
        /// Diagnostic text from the client.
        message: String,
    },
    /// The endpoint refused the login name or secret.
    #[error("authentication rejected: {message}")]
    Rejected {
        /// Diagnostic text from the client.
        message: String,
    },
    /// No answer within the allotted time.
    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    /// The local client could not be started at all.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

impl TransportError {
    /// Returns `true` for failures a reachable-or-not probe is expected to
    /// see; `false` for local faults that no amount of waiting will fix.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        !matches!(self, Self::Spawn { .. })
    }
}

/// Future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Minimal interface implemented by remote shell transports.
pub trait Transport {
    /// Opens one authenticated connection and closes it again.
    fn connect<'a>(
        &'a self,
        credential: &'a SessionCredential,
        timeout: Duration,
    ) -> TransportFuture<'a, ()>;

    /// Runs `command` and captures its output. A non-zero remote exit code is
    /// reported in [`CommandOutput::code`], not as an error.
    fn execute<'a>(
        &'a self,
        credential: &'a SessionCredential,
        command: &'a RemoteCommand,
        timeout: Duration,
    ) -> TransportFuture<'a, CommandOutput>;

    /// Opens a connection and keeps it open until the remote side drops it
    /// or `limit` elapses.
    fn hold<'a>(
        &'a self,
        credential: &'a SessionCredential,
        limit: Duration,
    ) -> TransportFuture<'a, HoldOutcome>;
}
