//! Unit tests for the ledger, skip rules and error classification.

use std::sync::Mutex;
use std::time::Duration;

use rstest::{fixture, rstest};
use serde_json::Value;
use tokio::time::Instant;

use super::*;
use crate::compute::{ApiRequest, ApiResponse, ComputeFuture};
use crate::session::TransportError;
use crate::test_support::{FakeCloud, FakeHosts, fake_suite_config};

/// Records delete paths and answers with a fixed status per path.
#[derive(Debug, Default)]
struct DeleteRecorder {
    statuses: Vec<(String, u16)>,
    deleted: Mutex<Vec<String>>,
}

impl DeleteRecorder {
    fn answering(statuses: &[(&str, u16)]) -> Self {
        Self {
            statuses: statuses
                .iter()
                .map(|(path, status)| ((*path).to_owned(), *status))
                .collect(),
            deleted: Mutex::default(),
        }
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().expect("recorder lock").clone()
    }
}

impl ComputeApi for DeleteRecorder {
    fn send(&self, request: ApiRequest) -> ComputeFuture<'_, ApiResponse> {
        self.deleted
            .lock()
            .expect("recorder lock")
            .push(request.path.clone());
        let status = self
            .statuses
            .iter()
            .find(|(path, _)| *path == request.path)
            .map_or(204, |(_, status)| *status);
        Box::pin(async move {
            Ok(ApiResponse {
                status,
                location: None,
                body: Value::Null,
            })
        })
    }
}

#[fixture]
fn ledger() -> ResourceLedger {
    let mut ledger = ResourceLedger::new();
    ledger.record_server(ResourceHandle::from("s1"));
    ledger.record_image(ResourceHandle::from("i1"));
    ledger.record_server(ResourceHandle::from("s2"));
    ledger
}

#[rstest]
#[tokio::test]
async fn release_deletes_newest_first(mut ledger: ResourceLedger) {
    let api = DeleteRecorder::default();

    ledger.release(&api).await.expect("all deletes succeed");

    assert_eq!(
        api.deleted(),
        vec!["/servers/s2", "/images/i1", "/servers/s1"]
    );
    assert!(ledger.is_empty());
}

#[rstest]
#[tokio::test]
async fn already_deleted_resources_count_as_released(mut ledger: ResourceLedger) {
    let api = DeleteRecorder::answering(&[("/images/i1", 404)]);

    let result = ledger.release(&api).await;

    assert_eq!(result, Ok(()));
}

#[rstest]
#[tokio::test]
async fn release_attempts_every_delete_and_collects_failures(mut ledger: ResourceLedger) {
    let api = DeleteRecorder::answering(&[("/servers/s2", 500), ("/servers/s1", 409)]);

    let err = ledger.release(&api).await.expect_err("two deletes fail");

    assert_eq!(api.deleted().len(), 3);
    assert_eq!(err.failures.len(), 2);
    assert!(err.to_string().contains("; "), "{err}");
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn released_image_is_no_longer_tracked() {
    let api = DeleteRecorder::default();
    let mut ledger = ResourceLedger::new();
    let image = ResourceHandle::from("i9");
    ledger.record_server(ResourceHandle::from("s9"));
    ledger.record_image(image.clone());

    ledger
        .release_image(&api, &image)
        .await
        .expect("image delete succeeds");

    assert_eq!(
        ledger.entries(),
        &[Resource::Server(ResourceHandle::from("s9"))]
    );
}

#[rstest]
#[case::single_node(false, Some("multiple compute nodes required"))]
#[case::multi_node(true, None)]
fn resize_scenarios_need_multiple_nodes(
    #[case] multi_node: bool,
    #[case] expected: Option<&'static str>,
) {
    let mut config = fake_suite_config();
    config.environment.multi_node = multi_node;
    let cases = all_scenarios::<FakeCloud, FakeHosts>();
    let resize = cases
        .iter()
        .find(|case| case.name == "servers::resize_confirm")
        .expect("resize scenario is registered");

    assert_eq!(resize.skip_reason(&config), expected);
}

#[test]
fn scenario_names_are_unique() {
    let cases = all_scenarios::<FakeCloud, FakeHosts>();
    let mut names: Vec<&str> = cases.iter().map(|case| case.name).collect();
    names.sort_unstable();
    names.dedup();

    assert_eq!(names.len(), cases.len());
}

#[rstest]
#[case::assertion(ScenarioError::Assertion(String::from("nope")), true)]
#[case::timeout(
    ScenarioError::Wait(WaitError::Timeout {
        handle: ResourceHandle::from("s1"),
        target: String::from("ACTIVE"),
        last_observed: String::from("BUILD"),
        elapsed: Duration::from_secs(600),
    }),
    true
)]
#[case::accessor(
    ScenarioError::Wait(WaitError::Source {
        handle: ResourceHandle::from("s1"),
        source: ComputeError::InvalidEndpoint(String::from("bad")),
    }),
    false
)]
#[case::local_transport(
    ScenarioError::Session(SessionError::Transport(TransportError::Spawn {
        program: String::from("sshpass"),
        message: String::from("not found"),
    })),
    false
)]
#[case::compute(ScenarioError::Compute(ComputeError::InvalidRequest(String::from("name"))), false)]
fn classifies_failures_and_errors(#[case] err: ScenarioError, #[case] failure: bool) {
    assert_eq!(err.is_failure(), failure, "{err}");
}

#[tokio::test]
async fn unknown_fixed_issue_rejects_the_context() {
    let mut config = fake_suite_config();
    config.environment.fixed_issues = String::from("lp000000");
    let cloud = FakeCloud::new();

    let result = SuiteContext::new(cloud.clone(), cloud.hosts(), config);

    assert!(matches!(result, Err(ConfigError::UnknownIssue(_))));
}

#[tokio::test(start_paused = true)]
async fn provisioned_servers_are_recorded_for_teardown() {
    let cloud = FakeCloud::new();
    let ctx = SuiteContext::new(cloud.clone(), cloud.hosts(), fake_suite_config())
        .expect("valid config");
    let mut ledger = ResourceLedger::new();

    let server = ctx
        .provision_server(&mut ledger, "probe", Some("secret"))
        .await
        .expect("create succeeds");
    ctx.wait_for_server(&server.id, "ACTIVE")
        .await
        .expect("server builds");
    let address = ctx.public_address(&server.id).await.expect("address");
    ctx.assert_login(&address, "secret").await.expect("login");

    assert_eq!(ledger.entries(), &[Resource::Server(server.id.clone())]);
    ledger.release(ctx.api()).await.expect("teardown");
    assert_eq!(cloud.server_count(), 0);
    assert!(ledger.is_empty());
}

#[tokio::test(start_paused = true)]
async fn login_waits_for_the_shell_service_after_the_server_turns_active() {
    let cloud = FakeCloud::new();
    let ctx = SuiteContext::new(cloud.clone(), cloud.hosts(), fake_suite_config())
        .expect("valid config");
    let mut ledger = ResourceLedger::new();
    let server = ctx
        .provision_server(&mut ledger, "slow-boot", Some("secret"))
        .await
        .expect("create succeeds");
    ctx.wait_for_server(&server.id, "ACTIVE")
        .await
        .expect("server builds");
    let address = ctx.public_address(&server.id).await.expect("address");

    let active_at = Instant::now();
    ctx.assert_login(&address, "secret")
        .await
        .expect("login succeeds once the host accepts connections");

    assert_eq!(active_at.elapsed(), Duration::from_secs(2));
    ledger.release(ctx.api()).await.expect("teardown");
}
