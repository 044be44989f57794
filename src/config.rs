//! Configuration loading via `ortho-config`.
//!
//! Three layered structs cover the compute endpoint, the environment under
//! test and the remote shell client. [`SuiteConfig`] loads and validates all
//! three once per run; scenarios only ever see it by reference.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::known_issues::{KnownIssues, UnknownIssue};
use crate::session::{SessionTimeouts, SshOptions};

/// Configuration file searched for by every section.
pub const CONFIG_FILE_NAME: &str = "stacktester.toml";

/// Compute endpoint settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STACKTESTER_COMPUTE",
    discovery(
        app_name = "stacktester",
        env_var = "STACKTESTER_CONFIG_PATH",
        config_file_name = "stacktester.toml",
        dotfile_name = ".stacktester.toml",
        project_file_name = "stacktester.toml"
    )
)]
pub struct ComputeConfig {
    /// URL scheme of the endpoint.
    #[ortho_config(default = "http".to_owned())]
    pub scheme: String,
    /// Host name or address of the compute API.
    #[ortho_config(default = String::new())]
    pub host: String,
    /// TCP port of the compute API.
    #[ortho_config(default = 8774)]
    pub port: u16,
    /// Version prefix appended to every request path.
    #[ortho_config(default = "v1.1".to_owned())]
    pub base_url: String,
    /// Token issued by the external credential provider.
    #[ortho_config(default = String::new())]
    pub auth_token: String,
    /// Longest time a single status wait may take.
    #[ortho_config(default = 600)]
    pub build_timeout_secs: u64,
    /// Pause between status polls.
    #[ortho_config(default = 1)]
    pub poll_interval_secs: u64,
    /// Per-request HTTP timeout.
    #[ortho_config(default = 30)]
    pub request_timeout_secs: u64,
}

impl ComputeConfig {
    /// Unversioned root, for example `http://nova:8774`.
    #[must_use]
    pub fn bookmark_root(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Versioned root every request path is appended to.
    #[must_use]
    pub fn api_root(&self) -> String {
        let version = self.base_url.trim_matches('/');
        if version.is_empty() {
            self.bookmark_root()
        } else {
            format!("{}/{version}", self.bookmark_root())
        }
    }

    /// Maximum duration of one status wait.
    #[must_use]
    pub const fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// Interval between status polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Checks required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] or [`ConfigError::Invalid`] with
    /// the environment variable and file key to fix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, field) in [
            (&self.scheme, FieldMetadata::compute("URL scheme", "scheme")),
            (&self.host, FieldMetadata::compute("compute API host", "host")),
            (&self.auth_token, FieldMetadata::compute("API auth token", "auth_token")),
        ] {
            require_field(value, &field)?;
        }
        require_positive(
            self.poll_interval_secs,
            &FieldMetadata::compute("poll interval", "poll_interval_secs"),
        )?;
        require_positive(
            self.build_timeout_secs,
            &FieldMetadata::compute("build timeout", "build_timeout_secs"),
        )?;
        require_positive(
            self.request_timeout_secs,
            &FieldMetadata::compute("request timeout", "request_timeout_secs"),
        )
    }
}

/// Images, flavors and capabilities of the deployment under test.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STACKTESTER_ENV",
    discovery(
        app_name = "stacktester",
        env_var = "STACKTESTER_CONFIG_PATH",
        config_file_name = "stacktester.toml",
        dotfile_name = ".stacktester.toml",
        project_file_name = "stacktester.toml"
    )
)]
pub struct EnvironmentConfig {
    /// Primary boot image.
    #[ortho_config(default = String::new())]
    pub image_ref: String,
    /// Alternate image used by rebuild scenarios.
    #[ortho_config(default = String::new())]
    pub image_ref_alt: String,
    /// Primary flavor.
    #[ortho_config(default = String::new())]
    pub flavor_ref: String,
    /// Alternate flavor used by resize scenarios.
    #[ortho_config(default = String::new())]
    pub flavor_ref_alt: String,
    /// Whether more than one compute node is available; resize needs it.
    #[ortho_config(default = false)]
    pub multi_node: bool,
    /// Comma-separated ids of known issues fixed in this deployment.
    #[ortho_config(default = String::new())]
    pub fixed_issues: String,
}

impl EnvironmentConfig {
    /// Parses [`EnvironmentConfig::fixed_issues`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownIssue`] for an unrecognised id.
    pub fn known_issues(&self) -> Result<KnownIssues, ConfigError> {
        KnownIssues::parse_fixed(&self.fixed_issues).map_err(ConfigError::from)
    }

    /// Checks required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first missing field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, field) in [
            (&self.image_ref, FieldMetadata::env("image reference", "image_ref")),
            (
                &self.image_ref_alt,
                FieldMetadata::env("alternate image reference", "image_ref_alt"),
            ),
            (&self.flavor_ref, FieldMetadata::env("flavor reference", "flavor_ref")),
            (
                &self.flavor_ref_alt,
                FieldMetadata::env("alternate flavor reference", "flavor_ref_alt"),
            ),
        ] {
            require_field(value, &field)?;
        }
        self.known_issues().map(|_| ())
    }
}

/// Remote shell client settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STACKTESTER_SSH",
    discovery(
        app_name = "stacktester",
        env_var = "STACKTESTER_CONFIG_PATH",
        config_file_name = "stacktester.toml",
        dotfile_name = ".stacktester.toml",
        project_file_name = "stacktester.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `sshpass` executable.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Login name on provisioned servers.
    #[ortho_config(default = "root".to_owned())]
    pub login: String,
    /// Port of the remote shell service.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Limit for one connection attempt.
    #[ortho_config(default = 300)]
    pub connect_timeout_secs: u64,
    /// Limit for a whole drop-and-reconnect cycle.
    #[ortho_config(default = 600)]
    pub cycle_timeout_secs: u64,
    /// Pause between reconnect probes.
    #[ortho_config(default = 2)]
    pub probe_interval_secs: u64,
    /// Whether to verify host keys; off by default for freshly built hosts.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
}

impl SshConfig {
    /// Timeouts handed to each [`crate::session::RemoteSession`].
    #[must_use]
    pub const fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            cycle: Duration::from_secs(self.cycle_timeout_secs),
            probe_interval: Duration::from_secs(self.probe_interval_secs),
        }
    }

    /// Client options for [`crate::session::SshTransport`].
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            sshpass_bin: self.sshpass_bin.clone(),
            strict_host_key_checking: self.strict_host_key_checking,
            known_hosts_file: self.known_hosts_file.clone(),
        }
    }

    /// Checks required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, field) in [
            (&self.ssh_bin, FieldMetadata::ssh("ssh executable", "ssh_bin")),
            (
                &self.sshpass_bin,
                FieldMetadata::ssh("sshpass executable", "sshpass_bin"),
            ),
            (&self.login, FieldMetadata::ssh("login name", "login")),
        ] {
            require_field(value, &field)?;
        }
        require_positive(
            self.connect_timeout_secs,
            &FieldMetadata::ssh("connect timeout", "connect_timeout_secs"),
        )?;
        require_positive(
            self.cycle_timeout_secs,
            &FieldMetadata::ssh("connection cycle timeout", "cycle_timeout_secs"),
        )?;
        require_positive(
            self.probe_interval_secs,
            &FieldMetadata::ssh("probe interval", "probe_interval_secs"),
        )
    }
}

/// Every setting a suite run needs, validated together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuiteConfig {
    /// Compute endpoint.
    pub compute: ComputeConfig,
    /// Deployment under test.
    pub environment: EnvironmentConfig,
    /// Remote shell client.
    pub ssh: SshConfig,
}

impl SuiteConfig {
    /// Loads all sections from defaults, configuration files and environment
    /// variables, then validates them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging fails and the validation
    /// errors of each section otherwise.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let args = || [std::ffi::OsString::from("stacktester")];
        let parse = |err: &dyn std::fmt::Display| ConfigError::Parse(err.to_string());
        let config = Self {
            compute: ComputeConfig::load_from_iter(args()).map_err(|err| parse(&err))?,
            environment: EnvironmentConfig::load_from_iter(args()).map_err(|err| parse(&err))?,
            ssh: SshConfig::load_from_iter(args()).map_err(|err| parse(&err))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first section error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compute.validate()?;
        self.environment.validate()?;
        self.ssh.validate()
    }
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    prefix: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn compute(description: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            prefix: "STACKTESTER_COMPUTE",
            toml_key,
            section: "compute",
        }
    }

    const fn env(description: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            prefix: "STACKTESTER_ENV",
            toml_key,
            section: "env",
        }
    }

    const fn ssh(description: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            prefix: "STACKTESTER_SSH",
            toml_key,
            section: "ssh",
        }
    }

    fn guidance(&self) -> String {
        format!(
            "set {}_{} or add {} to [{}] in {CONFIG_FILE_NAME}",
            self.prefix,
            self.toml_key.to_uppercase(),
            self.toml_key,
            self.section
        )
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: {}",
            metadata.description,
            metadata.guidance()
        )));
    }
    Ok(())
}

fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!(
            "{} must be at least one second: {}",
            metadata.description,
            metadata.guidance()
        )));
    }
    Ok(())
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A field holds a value outside its allowed range.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// `fixed_issues` names an issue this suite does not know.
    #[error(transparent)]
    UnknownIssue(#[from] UnknownIssue),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
