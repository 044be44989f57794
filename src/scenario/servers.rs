//! Server action scenarios: password change, reboot, rebuild and resize.
//!
//! Each starts from a server built from the primary image with a known root
//! password, waits for it to become `ACTIVE` and proves a login works before
//! exercising the action.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::info;

use super::assert::{ensure, ensure_eq, expect_status, member};
use super::{ResourceLedger, ScenarioError, ScenarioFuture, SuiteContext, SuiteTransport};
use crate::compute::{
    ComputeApi, PersonalityFile, RebootKind, RebuildRequest, Server, ServerAction,
};
use crate::handle::ResourceHandle;
use crate::known_issues::KnownIssue;
use crate::session::{RemoteCommand, RemoteSession};

const SERVER_NAME: &str = "stacktester1";
const INITIAL_PASSWORD: &str = "testpwd";
const CHANGED_PASSWORD: &str = "test123";
const REBUILT_NAME: &str = "stacktester2";
const SPECIFIED_PASSWORD: &str = "some_password";
const TEST_FILE: &str = "/tmp/testfile";
const TEST_FILE_CONTENTS: &str = "WORDS";
const INJECTED_FILE: &str = "/tmp/asdf";
const INJECTED_CONTENTS: &str = "XXX";

/// Server provisioned for an action scenario.
#[derive(Clone, Debug)]
struct ReadyServer {
    id: ResourceHandle,
    address: String,
    password: String,
}

async fn ready_server<A, T>(
    ctx: &SuiteContext<A, T>,
    ledger: &mut ResourceLedger,
) -> Result<ReadyServer, ScenarioError>
where
    A: ComputeApi,
    T: SuiteTransport,
{
    let created = ctx
        .provision_server(ledger, SERVER_NAME, Some(INITIAL_PASSWORD))
        .await?;
    ctx.wait_for_server(&created.id, "ACTIVE").await?;
    let address = ctx.public_address(&created.id).await?;
    ctx.assert_login(&address, INITIAL_PASSWORD).await?;
    Ok(ReadyServer {
        id: created.id,
        address,
        password: INITIAL_PASSWORD.to_owned(),
    })
}

/// Boot instant inferred from the guest's uptime at a local instant.
#[derive(Clone, Copy, Debug)]
struct BootObservation {
    observed_at: Instant,
    uptime: Duration,
}

impl BootObservation {
    /// `true` when `later` reports a boot strictly after this one.
    fn precedes(&self, later: &Self) -> bool {
        let between = later.observed_at.saturating_duration_since(self.observed_at);
        later.uptime < self.uptime + between
    }
}

async fn observe_boot<T: SuiteTransport>(
    session: &mut RemoteSession<T>,
) -> Result<BootObservation, ScenarioError> {
    let output = session.execute_command(&RemoteCommand::ReadUptime).await?;
    let observed_at = Instant::now();
    let uptime = parse_uptime(&output)?;
    Ok(BootObservation {
        observed_at,
        uptime,
    })
}

fn parse_uptime(output: &str) -> Result<Duration, ScenarioError> {
    output
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
        .ok_or_else(|| ScenarioError::Assertion(format!("unreadable uptime output: {output:?}")))
}

async fn read_file<T: SuiteTransport>(
    session: &mut RemoteSession<T>,
    path: &str,
) -> Result<String, ScenarioError> {
    Ok(session.execute_command(&RemoteCommand::read_file(path)).await?)
}

/// Changes the root password, then soft and hard reboots the server and
/// checks each reboot actually restarted the guest.
pub fn change_password_and_reboot<'a, A, T>(
    ctx: &'a SuiteContext<A, T>,
    ledger: &'a mut ResourceLedger,
) -> ScenarioFuture<'a>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    Box::pin(async move {
        let mut server = ready_server(ctx, ledger).await?;

        let action = ServerAction::ChangePassword {
            admin_pass: CHANGED_PASSWORD.to_owned(),
        };
        let response = ctx.api().server_action(&server.id, &action).await?;
        expect_status("changePassword", &response, 202)?;
        if ctx.issues().is_fixed(KnownIssue::PasswordStatus) {
            ctx.wait_for_server(&server.id, "PASSWORD").await?;
        }
        ctx.wait_for_server(&server.id, "ACTIVE").await?;
        ctx.assert_login(&server.address, CHANGED_PASSWORD).await?;
        server.password = CHANGED_PASSWORD.to_owned();

        reboot_and_verify(ctx, &server, RebootKind::Soft).await?;
        reboot_and_verify(ctx, &server, RebootKind::Hard).await
    })
}

async fn reboot_and_verify<A, T>(
    ctx: &SuiteContext<A, T>,
    server: &ReadyServer,
    kind: RebootKind,
) -> Result<(), ScenarioError>
where
    A: ComputeApi,
    T: SuiteTransport,
{
    let mut session = ctx.session(&server.address, &server.password);
    let before = observe_boot(&mut session).await?;

    let response = ctx
        .api()
        .server_action(&server.id, &ServerAction::Reboot(kind))
        .await?;
    expect_status("reboot", &response, 202)?;

    let (issue, transitional) = match kind {
        RebootKind::Soft => (KnownIssue::RebootStatus, "REBOOT"),
        RebootKind::Hard => (KnownIssue::HardRebootStatus, "HARD_REBOOT"),
    };
    if ctx.issues().is_fixed(issue) {
        ctx.wait_for_server(&server.id, transitional).await?;
    }

    let cycle = session.wait_until_connection_cycles().await?;
    info!(
        server = %server.id,
        ?kind,
        down_after_ms = cycle.down_after.as_millis(),
        up_after_ms = cycle.up_after.as_millis(),
        "reboot observed"
    );
    ctx.wait_for_server(&server.id, "ACTIVE").await?;

    let after = observe_boot(&mut session).await?;
    ensure(
        before.precedes(&after),
        format!(
            "{kind:?} reboot did not restart the guest (uptime {}s before, {}s after)",
            before.uptime.as_secs(),
            after.uptime.as_secs()
        ),
    )
}

fn rebuilt_server(response_body: &Value) -> Result<Server, ScenarioError> {
    let raw = member("rebuild response", response_body, "server")?;
    ensure(
        raw.get("personality").is_none(),
        "rebuild response must not echo personality",
    )?;
    Ok(Server::from_envelope("rebuild", response_body)?)
}

fn expected_metadata() -> BTreeMap<String, String> {
    BTreeMap::from([(String::from("1234"), String::from("5678"))])
}

/// Rebuilds onto the alternate image with new name, metadata and an
/// injected file, then rebuilds back with an explicit password.
pub fn rebuild<'a, A, T>(
    ctx: &'a SuiteContext<A, T>,
    ledger: &'a mut ResourceLedger,
) -> ScenarioFuture<'a>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    Box::pin(async move {
        let server = ready_server(ctx, ledger).await?;

        let mut session = ctx.session(&server.address, &server.password);
        session
            .execute_command(&RemoteCommand::write_file(TEST_FILE, TEST_FILE_CONTENTS))
            .await?;
        let written = read_file(&mut session, TEST_FILE).await?;
        ensure_eq("file written before rebuild", TEST_FILE_CONTENTS, written.as_str())?;

        let on_alternate = rebuild_onto_alternate(ctx, server).await?;
        rebuild_back_with_password(ctx, on_alternate).await
    })
}

async fn rebuild_onto_alternate<A, T>(
    ctx: &SuiteContext<A, T>,
    server: ReadyServer,
) -> Result<ReadyServer, ScenarioError>
where
    A: ComputeApi,
    T: SuiteTransport,
{
    let image_alt = &ctx.config().environment.image_ref_alt;
    let action = ServerAction::Rebuild(RebuildRequest {
        image_ref: image_alt.clone(),
        name: Some(REBUILT_NAME.to_owned()),
        metadata: Some(expected_metadata()),
        personality: vec![PersonalityFile {
            path: INJECTED_FILE.to_owned(),
            contents: INJECTED_CONTENTS.to_owned(),
        }],
        admin_pass: None,
    });
    let response = ctx.api().server_action(&server.id, &action).await?;
    expect_status("rebuild", &response, 202)?;
    let rebuilt = rebuilt_server(&response.body)?;
    let generated = rebuilt.admin_pass.clone().ok_or_else(|| {
        ScenarioError::Assertion(String::from("rebuild response carries no adminPass"))
    })?;

    let current = verify_rebuilt(ctx, &server.id, &rebuilt, image_alt).await?;
    let next = ReadyServer {
        address: current
            .public_address()
            .map_or(server.address, str::to_owned),
        id: server.id,
        password: generated,
    };

    ctx.assert_login(&next.address, &next.password).await?;
    let mut session = ctx.session(&next.address, &next.password);
    let old_file = read_file(&mut session, TEST_FILE).await?;
    ensure_eq("file written before rebuild", "", old_file.as_str())?;
    let injected = read_file(&mut session, INJECTED_FILE).await?;
    ensure_eq("injected file", INJECTED_CONTENTS, injected.as_str())?;
    Ok(next)
}

async fn rebuild_back_with_password<A, T>(
    ctx: &SuiteContext<A, T>,
    server: ReadyServer,
) -> Result<(), ScenarioError>
where
    A: ComputeApi,
    T: SuiteTransport,
{
    let image = &ctx.config().environment.image_ref;
    let action = ServerAction::Rebuild(RebuildRequest {
        image_ref: image.clone(),
        admin_pass: Some(SPECIFIED_PASSWORD.to_owned()),
        ..RebuildRequest::default()
    });
    let response = ctx.api().server_action(&server.id, &action).await?;
    expect_status("second rebuild", &response, 202)?;
    let rebuilt = rebuilt_server(&response.body)?;
    ensure_eq(
        "rebuild response adminPass",
        &Some(SPECIFIED_PASSWORD),
        &rebuilt.admin_pass.as_deref(),
    )?;

    let current = verify_rebuilt(ctx, &server.id, &rebuilt, image).await?;
    let address = current
        .public_address()
        .map_or(server.address, str::to_owned);

    ctx.assert_login(&address, SPECIFIED_PASSWORD).await?;
    let mut session = ctx.session(&address, SPECIFIED_PASSWORD);
    let injected = read_file(&mut session, INJECTED_FILE).await?;
    ensure_eq("previously injected file", "", injected.as_str())
}

/// Waits out a rebuild and checks image, metadata and name on both the
/// action response and a fresh read.
async fn verify_rebuilt<A, T>(
    ctx: &SuiteContext<A, T>,
    id: &ResourceHandle,
    rebuilt: &Server,
    image: &str,
) -> Result<Server, ScenarioError>
where
    A: ComputeApi,
    T: SuiteTransport,
{
    let transitional = ctx
        .issues()
        .pick(KnownIssue::RebuildStatus, "BUILD", "REBUILD");
    ctx.wait_for_server(id, transitional).await?;
    ctx.wait_for_server(id, "ACTIVE").await?;

    let current = ctx.api().get_server(id).await?;
    ensure(
        current.runs_image(image),
        format!("server does not run image {image}"),
    )?;
    let metadata = expected_metadata();
    ensure_eq("rebuild response metadata", &metadata, &rebuilt.metadata)?;
    ensure_eq("server metadata", &metadata, &current.metadata)?;
    ensure_eq("rebuild response name", REBUILT_NAME, rebuilt.name.as_str())?;
    ensure_eq("server name", REBUILT_NAME, current.name.as_str())?;
    Ok(current)
}

async fn resize_to_alternate<A, T>(
    ctx: &SuiteContext<A, T>,
    server: &ReadyServer,
) -> Result<(), ScenarioError>
where
    A: ComputeApi,
    T: SuiteTransport,
{
    let flavor_alt = &ctx.config().environment.flavor_ref_alt;
    let action = ServerAction::Resize {
        flavor_ref: flavor_alt.clone(),
    };
    let response = ctx.api().server_action(&server.id, &action).await?;
    expect_status("resize", &response, 202)?;

    let pending = ctx
        .issues()
        .pick(KnownIssue::VerifyResizeStatus, "RESIZE-CONFIRM", "VERIFY_RESIZE");
    ctx.wait_for_server(&server.id, pending).await?;

    let current = ctx.api().get_server(&server.id).await?;
    ensure_eq(
        "flavor after resize",
        &Some(flavor_alt.as_str()),
        &current.flavor_id(),
    )?;
    ctx.assert_login(&server.address, &server.password).await
}

/// Resizes to the alternate flavor and confirms.
pub fn resize_confirm<'a, A, T>(
    ctx: &'a SuiteContext<A, T>,
    ledger: &'a mut ResourceLedger,
) -> ScenarioFuture<'a>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    Box::pin(async move {
        let server = ready_server(ctx, ledger).await?;
        resize_to_alternate(ctx, &server).await?;

        let response = ctx
            .api()
            .server_action(&server.id, &ServerAction::ConfirmResize)
            .await?;
        expect_status("confirmResize", &response, 204)?;
        ctx.wait_for_server(&server.id, "ACTIVE").await?;

        let current = ctx.api().get_server(&server.id).await?;
        ensure_eq(
            "flavor after confirm",
            &Some(ctx.config().environment.flavor_ref_alt.as_str()),
            &current.flavor_id(),
        )
    })
}

/// Resizes to the alternate flavor and reverts.
pub fn resize_revert<'a, A, T>(
    ctx: &'a SuiteContext<A, T>,
    ledger: &'a mut ResourceLedger,
) -> ScenarioFuture<'a>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    Box::pin(async move {
        let server = ready_server(ctx, ledger).await?;
        resize_to_alternate(ctx, &server).await?;

        let response = ctx
            .api()
            .server_action(&server.id, &ServerAction::RevertResize)
            .await?;
        expect_status("revertResize", &response, 202)?;
        ctx.wait_for_server(&server.id, "ACTIVE").await?;

        let current = ctx.api().get_server(&server.id).await?;
        ensure_eq(
            "flavor after revert",
            &Some(ctx.config().environment.flavor_ref.as_str()),
            &current.flavor_id(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::proc_format("350735.50 234388.90", 350_735_500)]
    #[case::single_field("12.5", 12_500)]
    fn parses_uptime_seconds(#[case] output: &str, #[case] millis: u128) {
        assert_eq!(parse_uptime(output).expect("uptime").as_millis(), millis);
    }

    #[rstest]
    #[case::empty("")]
    #[case::garbage("cat: /proc/uptime: No such file")]
    #[case::negative("-4.0 1.0")]
    fn rejects_bad_uptime(#[case] output: &str) {
        assert!(parse_uptime(output).is_err());
    }

    #[test]
    fn later_boot_is_detected_across_observations() {
        let start = Instant::now();
        let before = BootObservation {
            observed_at: start,
            uptime: Duration::from_secs(300),
        };
        let rebooted = BootObservation {
            observed_at: start + Duration::from_secs(60),
            uptime: Duration::from_secs(5),
        };
        let not_rebooted = BootObservation {
            observed_at: start + Duration::from_secs(60),
            uptime: Duration::from_secs(360),
        };

        assert!(before.precedes(&rebooted));
        assert!(!before.precedes(&not_rebooted));
    }
}
