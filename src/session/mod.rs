//! Authenticated remote command execution against provisioned servers.
//!
//! A [`RemoteSession`] owns one immutable [`SessionCredential`] and a
//! [`Transport`]. It connects lazily, tracks whether the last interaction
//! left the transport connected, and can bracket a reboot by waiting for the
//! connection to drop and come back.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

mod command;
mod ssh;
mod transport;

pub use command::{RemoteCommand, UPTIME_PATH};
pub use ssh::{SshOptions, SshTransport};
pub use transport::{CommandOutput, HoldOutcome, Transport, TransportError, TransportFuture};

/// Default time allowed for establishing a single connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default budget for a whole drop-and-reconnect cycle.
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default pause between reconnect probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Login secret that never appears in debug output.
#[derive(Clone, Eq, PartialEq)]
pub struct Secret(String);

impl Secret {
    /// Wraps a password.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw secret for handing to the transport.
    #[must_use]
    pub const fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Address, login name and secret used by one session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionCredential {
    address: String,
    port: u16,
    login: String,
    secret: Secret,
}

impl SessionCredential {
    /// Builds a credential; there are no setters, a new secret means a new
    /// credential.
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        port: u16,
        login: impl Into<String>,
        secret: Secret,
    ) -> Self {
        Self {
            address: address.into(),
            port,
            login: login.into(),
            secret,
        }
    }

    /// Network address of the remote host.
    #[must_use]
    pub const fn address(&self) -> &str {
        self.address.as_str()
    }

    /// TCP port of the remote shell service.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Login name.
    #[must_use]
    pub const fn login(&self) -> &str {
        self.login.as_str()
    }

    /// Login secret.
    #[must_use]
    pub const fn secret(&self) -> &Secret {
        &self.secret
    }
}

/// Time limits applied by a [`RemoteSession`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionTimeouts {
    /// Limit for establishing one connection.
    pub connect: Duration,
    /// Limit for a whole drop-and-reconnect cycle.
    pub cycle: Duration,
    /// Pause between reconnect probes.
    pub probe_interval: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            cycle: DEFAULT_CYCLE_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

/// Whether the session believes its transport is connected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportState {
    /// No connection has succeeded since creation or the last failure.
    Disconnected,
    /// The last interaction with the endpoint succeeded.
    Connected,
}

/// Stage of a connection cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CyclePhase {
    /// Waiting for the existing connection to drop.
    Shutdown,
    /// Waiting for the endpoint to accept logins again.
    Startup,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("connection drop"),
            Self::Startup => f.write_str("reconnect"),
        }
    }
}

/// Timing of a completed connection cycle, measured from the call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CycleReport {
    /// When the connection was confirmed dropped.
    pub down_after: Duration,
    /// When a new connection succeeded.
    pub up_after: Duration,
}

/// Errors raised by [`RemoteSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// The command could not be run at all (as opposed to running and
    /// exiting non-zero).
    #[error("could not run `{command}` on {address}: {source}")]
    CommandExecution {
        /// Remote host address.
        address: String,
        /// Rendered command line.
        command: String,
        /// Transport failure.
        #[source]
        source: TransportError,
    },
    /// A phase of [`RemoteSession::wait_until_connection_cycles`] did not
    /// complete in time.
    #[error("timed out waiting for {phase} on {address} after {}s", waited.as_secs())]
    ConnectionCycleTimeout {
        /// Remote host address.
        address: String,
        /// Phase that did not complete.
        phase: CyclePhase,
        /// Time spent in the whole cycle.
        waited: Duration,
    },
    /// The endpoint refused the credential while it was expected to accept
    /// it.
    #[error("{address} rejected login {login}: {message}")]
    Authentication {
        /// Remote host address.
        address: String,
        /// Login name used.
        login: String,
        /// Diagnostic text from the client.
        message: String,
    },
    /// A local fault in the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Remote shell session bound to one credential.
#[derive(Debug)]
pub struct RemoteSession<T> {
    transport: T,
    credential: SessionCredential,
    timeouts: SessionTimeouts,
    state: TransportState,
}

impl<T: Transport> RemoteSession<T> {
    /// Creates a disconnected session. No network I/O happens here.
    #[must_use]
    pub const fn new(transport: T, credential: SessionCredential, timeouts: SessionTimeouts) -> Self {
        Self {
            transport,
            credential,
            timeouts,
            state: TransportState::Disconnected,
        }
    }

    /// Returns the credential this session was created with.
    #[must_use]
    pub const fn credential(&self) -> &SessionCredential {
        &self.credential
    }

    /// Returns the current transport state.
    #[must_use]
    pub const fn state(&self) -> TransportState {
        self.state
    }

    /// Tries to open one authenticated connection within the connect
    /// timeout, probing again while the endpoint is unreachable.
    ///
    /// Returns `Ok(false)` when the credential is refused or nothing answers
    /// before the connect timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] only for local faults such as a
    /// missing client binary.
    pub async fn test_connection_auth(&mut self) -> Result<bool, SessionError> {
        match self.connect_within_timeout().await {
            Ok(()) => {
                self.state = TransportState::Connected;
                Ok(true)
            }
            Err(err) if err.is_expected() => {
                debug!(address = self.credential.address(), error = %err, "login probe failed");
                self.state = TransportState::Disconnected;
                Ok(false)
            }
            Err(err) => Err(SessionError::Transport(err)),
        }
    }

    /// Runs `command` and returns its standard output with one trailing
    /// newline removed. Connects first when disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CommandExecution`] when no connection can be
    /// established or the command channel is refused, and
    /// [`SessionError::Transport`] for local faults.
    pub async fn execute_command(&mut self, command: &RemoteCommand) -> Result<String, SessionError> {
        let output = self.run(command).await?;
        if !output.is_success() {
            debug!(
                address = self.credential.address(),
                code = ?output.code,
                stderr = %output.stderr,
                "remote command exited unsuccessfully"
            );
        }
        Ok(trim_trailing_newline(output.stdout))
    }

    /// Runs `command` and returns the full output including the exit code.
    ///
    /// # Errors
    ///
    /// As for [`RemoteSession::execute_command`].
    pub async fn run(&mut self, command: &RemoteCommand) -> Result<CommandOutput, SessionError> {
        if self.state == TransportState::Disconnected {
            self.connect_within_timeout()
                .await
                .map_err(|err| self.command_error(command, err))?;
            self.state = TransportState::Connected;
        }

        match self
            .transport
            .execute(&self.credential, command, self.timeouts.connect)
            .await
        {
            Ok(output) => Ok(output),
            Err(err) => {
                self.state = TransportState::Disconnected;
                Err(self.command_error(command, err))
            }
        }
    }

    /// Blocks until the endpoint drops its connection and then accepts a new
    /// login, as happens across a reboot.
    ///
    /// Both phases share the session's cycle timeout, which is independent of
    /// any status wait the caller performs.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ConnectionCycleTimeout`] naming the phase that
    /// did not complete, [`SessionError::Authentication`] when the held
    /// connection is refused, and [`SessionError::Transport`] for local
    /// faults.
    pub async fn wait_until_connection_cycles(&mut self) -> Result<CycleReport, SessionError> {
        let started = Instant::now();
        let deadline = started + self.timeouts.cycle;

        self.wait_for_drop(started).await?;
        self.state = TransportState::Disconnected;
        let down_after = started.elapsed();
        info!(
            address = self.credential.address(),
            down_after_ms = down_after.as_millis(),
            "connection dropped"
        );

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.cycle_timeout(CyclePhase::Startup, started));
            }
            let remaining = deadline - now;

            match self
                .transport
                .connect(&self.credential, self.timeouts.connect.min(remaining))
                .await
            {
                Ok(()) => {
                    self.state = TransportState::Connected;
                    let up_after = started.elapsed();
                    info!(
                        address = self.credential.address(),
                        up_after_ms = up_after.as_millis(),
                        "endpoint accepting logins again"
                    );
                    return Ok(CycleReport {
                        down_after,
                        up_after,
                    });
                }
                Err(err) if err.is_expected() => {
                    debug!(address = self.credential.address(), error = %err, "endpoint still down");
                }
                Err(err) => return Err(SessionError::Transport(err)),
            }

            let now_after_probe = Instant::now();
            if now_after_probe < deadline {
                sleep(self.timeouts.probe_interval.min(deadline - now_after_probe)).await;
            }
        }
    }

    /// Connects, retrying unreachable and timed-out attempts every probe
    /// interval until the connect timeout elapses. A refused credential and
    /// local faults end the attempt at once.
    async fn connect_within_timeout(&self) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.timeouts.connect;
        let mut attempts = 0_u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            attempts += 1;
            let err = match self.transport.connect(&self.credential, remaining).await {
                Ok(()) => return Ok(()),
                Err(err) if is_transient(&err) => err,
                Err(err) => return Err(err),
            };

            let now = Instant::now();
            let pause = self
                .timeouts
                .probe_interval
                .min(deadline.saturating_duration_since(now));
            if pause.is_zero() || now + pause >= deadline {
                warn!(
                    address = self.credential.address(),
                    attempts,
                    error = %err,
                    "endpoint never accepted a login"
                );
                return Err(err);
            }
            debug!(
                address = self.credential.address(),
                attempts,
                error = %err,
                "endpoint not accepting logins yet"
            );
            sleep(pause).await;
        }
    }

    async fn wait_for_drop(&self, started: Instant) -> Result<(), SessionError> {
        match self
            .transport
            .hold(&self.credential, self.timeouts.cycle)
            .await
        {
            Ok(HoldOutcome::Dropped | HoldOutcome::Unreachable)
            | Err(TransportError::Unreachable { .. } | TransportError::TimedOut(_)) => Ok(()),
            Ok(HoldOutcome::StillOpen) => {
                warn!(address = self.credential.address(), "connection never dropped");
                Err(self.cycle_timeout(CyclePhase::Shutdown, started))
            }
            Err(TransportError::Rejected { message }) => Err(SessionError::Authentication {
                address: self.credential.address().to_owned(),
                login: self.credential.login().to_owned(),
                message,
            }),
            Err(err @ TransportError::Spawn { .. }) => Err(SessionError::Transport(err)),
        }
    }

    fn cycle_timeout(&self, phase: CyclePhase, started: Instant) -> SessionError {
        SessionError::ConnectionCycleTimeout {
            address: self.credential.address().to_owned(),
            phase,
            waited: started.elapsed(),
        }
    }

    fn command_error(&self, command: &RemoteCommand, err: TransportError) -> SessionError {
        if err.is_expected() {
            SessionError::CommandExecution {
                address: self.credential.address().to_owned(),
                command: command.render(),
                source: err,
            }
        } else {
            SessionError::Transport(err)
        }
    }
}

/// Failures that go away once the endpoint finishes booting.
const fn is_transient(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::Unreachable { .. } | TransportError::TimedOut(_)
    )
}

fn trim_trailing_newline(mut text: String) -> String {
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    text
}
