//! [`Transport`] backed by the system `ssh` client.
//!
//! Password logins go through `sshpass -e`, which reads the secret from the
//! `SSHPASS` environment variable so it never appears on a command line.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::SessionCredential;
use super::command::RemoteCommand;
use super::transport::{CommandOutput, HoldOutcome, Transport, TransportError, TransportFuture};

/// Exit status `ssh` uses for its own failures.
const SSH_ERROR_STATUS: i32 = 255;
/// Exit status `sshpass` uses for an incorrect password.
const SSHPASS_BAD_PASSWORD: i32 = 5;
/// Exit status `sshpass` uses for an unknown host key.
const SSHPASS_UNKNOWN_HOST_KEY: i32 = 6;

/// Extra time a command may run after its connection was established.
const COMMAND_GRACE: Duration = Duration::from_secs(30);
/// Connect timeout used when opening a held connection.
const HOLD_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Keepalive cadence on held connections so a vanished host is noticed.
const HOLD_KEEPALIVE_SECS: u64 = 1;
const HOLD_KEEPALIVE_COUNT: u64 = 3;

const UNREACHABLE_MARKERS: [&str; 5] = [
    "Connection refused",
    "Connection timed out",
    "No route to host",
    "Network is unreachable",
    "Could not resolve hostname",
];

/// Client settings for [`SshTransport`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `sshpass` executable.
    pub sshpass_bin: String,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; empty leaves the client default.
    pub known_hosts_file: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            sshpass_bin: String::from("sshpass"),
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
        }
    }
}

/// A prepared process launch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Invocation {
    pub(crate) program: String,
    pub(crate) args: Vec<OsString>,
    pub(crate) env: Vec<(String, String)>,
}

/// Runs remote commands by spawning `sshpass -e ssh ...` per operation.
#[derive(Clone, Debug, Default)]
pub struct SshTransport {
    options: SshOptions,
}

impl SshTransport {
    /// Creates a transport using `options`.
    #[must_use]
    pub const fn new(options: SshOptions) -> Self {
        Self { options }
    }

    pub(crate) fn build_invocation(
        &self,
        credential: &SessionCredential,
        remote_command: &str,
        connect_timeout: Duration,
        keepalive: bool,
    ) -> Invocation {
        let mut args = vec![OsString::from("-e"), OsString::from(&self.options.ssh_bin)];
        args.extend(self.common_ssh_options(credential.port(), connect_timeout));
        if keepalive {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "ServerAliveInterval={HOLD_KEEPALIVE_SECS}"
            )));
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "ServerAliveCountMax={HOLD_KEEPALIVE_COUNT}"
            )));
        }
        args.push(OsString::from(format!(
            "{}@{}",
            credential.login(),
            credential.address()
        )));
        args.push(OsString::from(remote_command));

        Invocation {
            program: self.options.sshpass_bin.clone(),
            args,
            env: vec![(
                String::from("SSHPASS"),
                credential.secret().expose().to_owned(),
            )],
        }
    }

    fn common_ssh_options(&self, port: u16, connect_timeout: Duration) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(port.to_string()),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                connect_timeout.as_secs().max(1)
            )),
            OsString::from("-o"),
            OsString::from("PubkeyAuthentication=no"),
            OsString::from("-o"),
            OsString::from("PreferredAuthentications=password,keyboard-interactive"),
            OsString::from("-o"),
            OsString::from("NumberOfPasswordPrompts=1"),
            OsString::from("-o"),
            OsString::from("LogLevel=ERROR"),
        ];

        if !self.options.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.options.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.options.known_hosts_file
            )));
        }

        args
    }

    /// Spawns `invocation`, returning `None` when `limit` elapses first. The
    /// child is killed when the timed-out future is dropped.
    async fn spawn(
        invocation: &Invocation,
        limit: Duration,
    ) -> Result<Option<CommandOutput>, TransportError> {
        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let Ok(result) = timeout(limit, child).await else {
            return Ok(None);
        };
        let output = result.map_err(|err| TransportError::Spawn {
            program: invocation.program.clone(),
            message: err.to_string(),
        })?;

        Ok(Some(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }))
    }
}

/// Maps client exit statuses to transport failures. Remote command exit
/// codes that collide with these values are indistinguishable and are
/// reported as transport failures.
pub(crate) fn classify(output: &CommandOutput) -> Option<TransportError> {
    let message = output.stderr.trim().to_owned();
    match output.code {
        Some(SSHPASS_BAD_PASSWORD | SSHPASS_UNKNOWN_HOST_KEY) => {
            Some(TransportError::Rejected { message })
        }
        Some(SSH_ERROR_STATUS) if message.contains("Permission denied") => {
            Some(TransportError::Rejected { message })
        }
        Some(SSH_ERROR_STATUS) | None => Some(TransportError::Unreachable { message }),
        Some(_) => None,
    }
}

fn never_connected(output: &CommandOutput) -> bool {
    UNREACHABLE_MARKERS
        .iter()
        .any(|marker| output.stderr.contains(marker))
}

impl Transport for SshTransport {
    fn connect<'a>(
        &'a self,
        credential: &'a SessionCredential,
        timeout_limit: Duration,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let invocation = self.build_invocation(
                credential,
                &RemoteCommand::Noop.render(),
                timeout_limit,
                false,
            );
            let Some(output) = Self::spawn(&invocation, timeout_limit).await? else {
                return Err(TransportError::TimedOut(timeout_limit));
            };
            if output.is_success() {
                return Ok(());
            }
            Err(classify(&output).unwrap_or(TransportError::Unreachable {
                message: output.stderr.trim().to_owned(),
            }))
        })
    }

    fn execute<'a>(
        &'a self,
        credential: &'a SessionCredential,
        command: &'a RemoteCommand,
        timeout_limit: Duration,
    ) -> TransportFuture<'a, CommandOutput> {
        Box::pin(async move {
            let rendered = command.render();
            debug!(address = credential.address(), command = %rendered, "running remote command");
            let invocation = self.build_invocation(credential, &rendered, timeout_limit, false);
            let limit = timeout_limit + COMMAND_GRACE;
            let Some(output) = Self::spawn(&invocation, limit).await? else {
                return Err(TransportError::TimedOut(limit));
            };
            match classify(&output) {
                Some(err) => Err(err),
                None => Ok(output),
            }
        })
    }

    fn hold<'a>(
        &'a self,
        credential: &'a SessionCredential,
        limit: Duration,
    ) -> TransportFuture<'a, HoldOutcome> {
        Box::pin(async move {
            let idle = RemoteCommand::Hold {
                seconds: limit.as_secs().saturating_add(COMMAND_GRACE.as_secs()),
            };
            let invocation =
                self.build_invocation(credential, &idle.render(), HOLD_CONNECT_TIMEOUT, true);
            let Some(output) = Self::spawn(&invocation, limit).await? else {
                return Ok(HoldOutcome::StillOpen);
            };
            if let Some(TransportError::Rejected { message }) = classify(&output) {
                return Err(TransportError::Rejected { message });
            }
            if never_connected(&output) {
                return Ok(HoldOutcome::Unreachable);
            }
            Ok(HoldOutcome::Dropped)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Secret;
    use rstest::{fixture, rstest};

    #[fixture]
    fn credential() -> SessionCredential {
        SessionCredential::new("203.0.113.7", 2222, "root", Secret::new("testpwd"))
    }

    fn output(code: Option<i32>, stderr: &str) -> CommandOutput {
        CommandOutput {
            code,
            stdout: String::new(),
            stderr: stderr.to_owned(),
        }
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[rstest]
    fn invocation_wraps_ssh_in_sshpass_and_keeps_secret_off_argv(
        credential: SessionCredential,
    ) {
        let transport = SshTransport::default();
        let invocation =
            transport.build_invocation(&credential, "cat /proc/uptime", Duration::from_secs(30), false);
        let args = strings(&invocation.args);

        assert_eq!(invocation.program, "sshpass");
        assert_eq!(args.first().map(String::as_str), Some("-e"));
        assert_eq!(args.get(1).map(String::as_str), Some("ssh"));
        assert!(args.contains(&String::from("2222")), "{args:?}");
        assert!(args.contains(&String::from("ConnectTimeout=30")), "{args:?}");
        assert!(args.contains(&String::from("root@203.0.113.7")), "{args:?}");
        assert_eq!(args.last().map(String::as_str), Some("cat /proc/uptime"));
        assert!(
            !args.iter().any(|arg| arg.contains("testpwd")),
            "secret leaked into argv: {args:?}"
        );
        assert_eq!(
            invocation.env,
            vec![(String::from("SSHPASS"), String::from("testpwd"))]
        );
    }

    #[rstest]
    fn held_connections_enable_keepalive(credential: SessionCredential) {
        let transport = SshTransport::default();
        let invocation =
            transport.build_invocation(&credential, "sleep 60", HOLD_CONNECT_TIMEOUT, true);
        let args = strings(&invocation.args);

        assert!(args.contains(&String::from("ServerAliveInterval=1")), "{args:?}");
        assert!(args.contains(&String::from("ServerAliveCountMax=3")), "{args:?}");
    }

    #[rstest]
    fn strict_host_key_checking_drops_override(credential: SessionCredential) {
        let transport = SshTransport::new(SshOptions {
            strict_host_key_checking: true,
            known_hosts_file: String::new(),
            ..SshOptions::default()
        });
        let args = strings(
            &transport
                .build_invocation(&credential, "true", Duration::from_secs(5), false)
                .args,
        );

        assert!(!args.contains(&String::from("StrictHostKeyChecking=no")));
        assert!(!args.iter().any(|arg| arg.starts_with("UserKnownHostsFile")));
    }

    #[rstest]
    #[case::bad_password(Some(5), "", true)]
    #[case::permission_denied(Some(255), "root@host: Permission denied (password).", true)]
    #[case::refused(Some(255), "ssh: connect to host port 22: Connection refused", false)]
    #[case::killed(None, "", false)]
    fn classifies_client_failures(
        #[case] code: Option<i32>,
        #[case] stderr: &str,
        #[case] rejected: bool,
    ) {
        let err = classify(&output(code, stderr)).expect("should classify as failure");
        assert_eq!(matches!(err, TransportError::Rejected { .. }), rejected, "{err:?}");
    }

    #[rstest]
    #[case::success(Some(0))]
    #[case::missing_file(Some(1))]
    #[case::remote_failure(Some(42))]
    fn remote_exit_codes_are_not_transport_failures(#[case] code: Option<i32>) {
        assert!(classify(&output(code, "")).is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn missing_client_binary_is_a_spawn_error(credential: SessionCredential) {
        let transport = SshTransport::new(SshOptions {
            sshpass_bin: String::from("/nonexistent/sshpass"),
            ..SshOptions::default()
        });

        let err = transport
            .connect(&credential, Duration::from_secs(1))
            .await
            .expect_err("spawn should fail");

        assert!(matches!(err, TransportError::Spawn { .. }), "{err:?}");
        assert!(!err.is_expected());
    }
}
