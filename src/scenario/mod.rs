//! Conformance scenarios and the context they run in.
//!
//! A scenario is a plain function taking the shared [`SuiteContext`] and a
//! fresh [`ResourceLedger`]. Everything it provisions goes into the ledger,
//! which the runner releases whatever the scenario's outcome.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compute::{ComputeApi, ComputeError, ImageStatus, Server, ServerRequest, ServerStatus};
use crate::config::{ConfigError, SuiteConfig};
use crate::handle::ResourceHandle;
use crate::known_issues::KnownIssues;
use crate::session::{RemoteSession, Secret, SessionCredential, SessionError, Transport};
use crate::wait::{StatusWaiter, WaitError, WaitOutcome};

pub mod assert;
pub mod flavors;
pub mod images;
pub mod servers;
pub mod snapshots;

/// Transport usable by scenarios: cloned into one session per login.
pub trait SuiteTransport: Transport + Clone + Send + Sync + 'static {}

impl<T> SuiteTransport for T where T: Transport + Clone + Send + Sync + 'static {}

/// Errors ending a scenario early.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// An expectation about the system under test did not hold.
    #[error("assertion failed: {0}")]
    Assertion(String),
    /// A status wait did not succeed.
    #[error(transparent)]
    Wait(#[from] WaitError<ComputeError>),
    /// A remote session operation did not succeed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// A compute API call failed outside any assertion.
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

impl ScenarioError {
    /// Returns `true` when the system under test misbehaved, and `false`
    /// when the harness could not complete the check (for example a
    /// transport fault).
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        match self {
            Self::Assertion(_) => true,
            Self::Wait(err) => !matches!(err, WaitError::Source { .. }),
            Self::Session(err) => !matches!(err, SessionError::Transport(_)),
            Self::Compute(_) => false,
        }
    }
}

/// Future returned by a scenario body.
pub type ScenarioFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ScenarioError>> + Send + 'a>>;

/// Scenario body signature.
pub type ScenarioFn<A, T> =
    for<'a> fn(&'a SuiteContext<A, T>, &'a mut ResourceLedger) -> ScenarioFuture<'a>;

/// Deployment capability a scenario depends on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Requirement {
    /// Runs everywhere.
    None,
    /// Needs at least two compute nodes.
    MultiNode,
}

/// A named scenario.
pub struct ScenarioCase<A, T> {
    /// Stable name, for example `servers::rebuild`.
    pub name: &'static str,
    /// One-line description.
    pub summary: &'static str,
    /// Capability the deployment must offer.
    pub requirement: Requirement,
    /// Scenario body.
    pub body: ScenarioFn<A, T>,
}

impl<A, T> ScenarioCase<A, T> {
    /// Returns why the scenario cannot run against `config`, if it cannot.
    #[must_use]
    pub const fn skip_reason(&self, config: &SuiteConfig) -> Option<&'static str> {
        match self.requirement {
            Requirement::MultiNode if !config.environment.multi_node => {
                Some("multiple compute nodes required")
            }
            Requirement::None | Requirement::MultiNode => None,
        }
    }
}

impl<A, T> Clone for ScenarioCase<A, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            summary: self.summary,
            requirement: self.requirement,
            body: self.body,
        }
    }
}

impl<A, T> std::fmt::Debug for ScenarioCase<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioCase")
            .field("name", &self.name)
            .field("requirement", &self.requirement)
            .finish_non_exhaustive()
    }
}

/// Every scenario in the suite, in execution order.
#[must_use]
pub fn all_scenarios<A, T>() -> Vec<ScenarioCase<A, T>>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    vec![
        ScenarioCase {
            name: "servers::change_password_and_reboot",
            summary: "change the root password, then soft and hard reboot",
            requirement: Requirement::None,
            body: servers::change_password_and_reboot,
        },
        ScenarioCase {
            name: "servers::rebuild",
            summary: "rebuild onto another image and back",
            requirement: Requirement::None,
            body: servers::rebuild,
        },
        ScenarioCase {
            name: "servers::resize_confirm",
            summary: "resize to the alternate flavor and confirm",
            requirement: Requirement::MultiNode,
            body: servers::resize_confirm,
        },
        ScenarioCase {
            name: "servers::resize_revert",
            summary: "resize to the alternate flavor and revert",
            requirement: Requirement::MultiNode,
            body: servers::resize_revert,
        },
        ScenarioCase {
            name: "snapshots::snapshot_server_active",
            summary: "snapshot an ACTIVE server through the createImage action",
            requirement: Requirement::None,
            body: snapshots::snapshot_server_active,
        },
        ScenarioCase {
            name: "snapshots::snapshot_server_inactive",
            summary: "snapshot a server that is still building",
            requirement: Requirement::None,
            body: snapshots::snapshot_server_inactive,
        },
        ScenarioCase {
            name: "images::index",
            summary: "list images",
            requirement: Requirement::None,
            body: images::index,
        },
        ScenarioCase {
            name: "images::detail",
            summary: "list images in detail",
            requirement: Requirement::None,
            body: images::detail,
        },
        ScenarioCase {
            name: "images::snapshot_active_server",
            summary: "snapshot an ACTIVE server through POST /images",
            requirement: Requirement::None,
            body: images::snapshot_active_server,
        },
        ScenarioCase {
            name: "images::snapshot_server_not_active",
            summary: "snapshot a building server through POST /images",
            requirement: Requirement::None,
            body: images::snapshot_server_not_active,
        },
        ScenarioCase {
            name: "flavors::flavor_details",
            summary: "fetch flavor 1",
            requirement: Requirement::None,
            body: flavors::flavor_details,
        },
    ]
}

/// Resource recorded for teardown.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resource {
    /// A server.
    Server(ResourceHandle),
    /// An image or snapshot.
    Image(ResourceHandle),
}

/// Teardown failures for one ledger.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{}", failures.join("; "))]
pub struct TeardownError {
    /// One message per resource that could not be deleted.
    pub failures: Vec<String>,
}

/// Per-scenario record of provisioned resources.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Vec<Resource>,
}

impl ResourceLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Records a server for teardown.
    pub fn record_server(&mut self, id: ResourceHandle) {
        self.entries.push(Resource::Server(id));
    }

    /// Records an image for teardown.
    pub fn record_image(&mut self, id: ResourceHandle) {
        self.entries.push(Resource::Image(id));
    }

    /// Resources still owed a delete, oldest first.
    #[must_use]
    pub fn entries(&self) -> &[Resource] {
        &self.entries
    }

    /// Returns `true` when nothing is left to release.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deletes one image now and stops tracking it.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Compute`] when the delete fails; the image
    /// then stays recorded.
    pub async fn release_image<A: ComputeApi + ?Sized>(
        &mut self,
        api: &A,
        id: &ResourceHandle,
    ) -> Result<(), ScenarioError> {
        api.delete_image(id).await?;
        self.entries
            .retain(|entry| !matches!(entry, Resource::Image(image) if image == id));
        Ok(())
    }

    /// Deletes every recorded resource, newest first. A resource the API
    /// already reports missing counts as released.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError`] listing every delete that failed. All
    /// deletes are attempted regardless.
    pub async fn release<A: ComputeApi + ?Sized>(&mut self, api: &A) -> Result<(), TeardownError> {
        let mut failures = Vec::new();
        while let Some(entry) = self.entries.pop() {
            let (kind, result) = match &entry {
                Resource::Server(id) => ("server", api.delete_server(id).await),
                Resource::Image(id) => ("image", api.delete_image(id).await),
            };
            match result {
                Ok(()) => debug!(?entry, "released"),
                Err(err) if err.is_not_found() => debug!(?entry, "already gone"),
                Err(err) => {
                    warn!(?entry, error = %err, "teardown failed");
                    failures.push(format!("{kind} delete failed: {err}"));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }
}

/// Shared state handed to every scenario.
#[derive(Debug)]
pub struct SuiteContext<A, T> {
    api: A,
    transport: T,
    config: SuiteConfig,
    issues: KnownIssues,
    waiter: StatusWaiter,
}

impl<A, T> SuiteContext<A, T>
where
    A: ComputeApi,
    T: Transport + Clone,
{
    /// Builds a context from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `fixed_issues` names an unknown issue.
    pub fn new(api: A, transport: T, config: SuiteConfig) -> Result<Self, ConfigError> {
        let issues = config.environment.known_issues()?;
        let waiter = StatusWaiter::new(
            config.compute.poll_interval(),
            config.compute.build_timeout(),
        );
        Ok(Self {
            api,
            transport,
            config,
            issues,
            waiter,
        })
    }

    /// Compute API client.
    #[must_use]
    pub const fn api(&self) -> &A {
        &self.api
    }

    /// Suite configuration.
    #[must_use]
    pub const fn config(&self) -> &SuiteConfig {
        &self.config
    }

    /// Known issues declared fixed.
    #[must_use]
    pub const fn issues(&self) -> &KnownIssues {
        &self.issues
    }

    /// Waits until a server reports `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Wait`] on timeout or accessor failure.
    pub async fn wait_for_server(
        &self,
        id: &ResourceHandle,
        target: &str,
    ) -> Result<WaitOutcome, ScenarioError> {
        Ok(self.waiter.wait(&ServerStatus(&self.api), id, target).await?)
    }

    /// Waits until an image reports `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Wait`] on timeout or accessor failure.
    pub async fn wait_for_image(
        &self,
        id: &ResourceHandle,
        target: &str,
    ) -> Result<WaitOutcome, ScenarioError> {
        Ok(self.waiter.wait(&ImageStatus(&self.api), id, target).await?)
    }

    /// Requests a server built from the primary image and flavor and records
    /// it in `ledger`. Returns the create response.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Compute`] when the request is rejected.
    pub async fn provision_server(
        &self,
        ledger: &mut ResourceLedger,
        name: &str,
        admin_pass: Option<&str>,
    ) -> Result<Server, ScenarioError> {
        let environment = &self.config.environment;
        let mut builder = ServerRequest::builder()
            .name(name)
            .image_ref(&environment.image_ref)
            .flavor_ref(&environment.flavor_ref);
        if let Some(pass) = admin_pass {
            builder = builder.admin_pass(pass);
        }
        let created = self.api.create_server(&builder.build()?).await?;
        ledger.record_server(created.id.clone());
        info!(server = %created.id, name, "server requested");
        Ok(created)
    }

    /// Fetches a server and returns its first public address.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Assertion`] when no public address is
    /// reported.
    pub async fn public_address(&self, id: &ResourceHandle) -> Result<String, ScenarioError> {
        let server = self.api.get_server(id).await?;
        server
            .public_address()
            .map(str::to_owned)
            .ok_or_else(|| ScenarioError::Assertion(format!("server {id} has no public address")))
    }

    /// Opens a session to `address` using the configured login and
    /// `password`. No I/O happens until the session is used.
    #[must_use]
    pub fn session(&self, address: &str, password: &str) -> RemoteSession<T> {
        let ssh = &self.config.ssh;
        let credential =
            SessionCredential::new(address, ssh.port, ssh.login.as_str(), Secret::new(password));
        RemoteSession::new(self.transport.clone(), credential, ssh.session_timeouts())
    }

    /// Asserts that `password` logs in to `address`.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Assertion`] when the login is refused or the
    /// host is unreachable.
    pub async fn assert_login(&self, address: &str, password: &str) -> Result<(), ScenarioError> {
        let accepted = self.session(address, password).test_connection_auth().await?;
        assert::ensure(
            accepted,
            format!(
                "could not log in to {address} as {} with the expected password",
                self.config.ssh.login
            ),
        )
    }
}

#[cfg(test)]
mod tests;
