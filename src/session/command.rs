//! Typed remote shell commands.
//!
//! Scenarios never format shell strings themselves; they describe the
//! operation and this module renders it with every operand shell-escaped.

use camino::Utf8PathBuf;
use shell_escape::unix::escape;

/// Path of the kernel uptime file read to derive boot time.
pub const UPTIME_PATH: &str = "/proc/uptime";

/// Operation to run on a remote host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteCommand {
    /// Prints the contents of a file. A missing file yields empty output.
    ReadFile {
        /// Absolute path on the remote host.
        path: Utf8PathBuf,
    },
    /// Replaces a file with exactly `contents` (no trailing newline).
    WriteFile {
        /// Absolute path on the remote host.
        path: Utf8PathBuf,
        /// Bytes to write, as text.
        contents: String,
    },
    /// Prints `/proc/uptime`.
    ReadUptime,
    /// Exits immediately; used to prove a login works.
    Noop,
    /// Keeps the session open for `seconds`.
    Hold {
        /// How long the remote side should stay idle.
        seconds: u64,
    },
}

impl RemoteCommand {
    /// Reads `path` on the remote host.
    #[must_use]
    pub fn read_file(path: impl Into<Utf8PathBuf>) -> Self {
        Self::ReadFile { path: path.into() }
    }

    /// Writes `contents` to `path` on the remote host.
    #[must_use]
    pub fn write_file(path: impl Into<Utf8PathBuf>, contents: impl Into<String>) -> Self {
        Self::WriteFile {
            path: path.into(),
            contents: contents.into(),
        }
    }

    /// Renders the command line passed to the remote shell.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::ReadFile { path } => {
                format!("cat -- {} 2>/dev/null", escape(path.as_str().into()))
            }
            Self::WriteFile { path, contents } => format!(
                "printf '%s' {} > {}",
                escape(contents.as_str().into()),
                escape(path.as_str().into())
            ),
            Self::ReadUptime => format!("cat {UPTIME_PATH}"),
            Self::Noop => String::from("true"),
            Self::Hold { seconds } => format!("sleep {seconds}"),
        }
    }
}
