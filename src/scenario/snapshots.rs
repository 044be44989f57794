//! Snapshots taken through the `createImage` server action.

use tracing::info;

use super::assert::{ensure, ensure_eq, expect_status};
use super::{ResourceLedger, ScenarioError, ScenarioFuture, SuiteContext, SuiteTransport};
use crate::compute::{ApiRequest, ComputeApi, Image, ServerAction};
use crate::known_issues::KnownIssue;

const SERVER_NAME: &str = "stacktester1";
const SNAPSHOT_NAME: &str = "backup";

fn create_image_action() -> ServerAction {
    ServerAction::CreateImage {
        name: SNAPSHOT_NAME.to_owned(),
    }
}

/// Snapshots an `ACTIVE` server and waits for the image to become usable.
pub fn snapshot_server_active<'a, A, T>(
    ctx: &'a SuiteContext<A, T>,
    ledger: &'a mut ResourceLedger,
) -> ScenarioFuture<'a>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    Box::pin(async move {
        let server = ctx.provision_server(ledger, SERVER_NAME, None).await?;
        ctx.wait_for_server(&server.id, "ACTIVE").await?;

        let response = ctx
            .api()
            .server_action(&server.id, &create_image_action())
            .await?;
        expect_status("createImage", &response, 202)?;
        let snapshot_id = response.location_id().ok_or_else(|| {
            ScenarioError::Assertion(String::from("createImage response has no Location"))
        })?;
        ledger.record_image(snapshot_id.clone());
        info!(server = %server.id, image = %snapshot_id, "snapshot requested");

        let fetched = ctx
            .api()
            .send(ApiRequest::get(format!("/images/{snapshot_id}")))
            .await?;
        expect_status("get snapshot", &fetched, 200)?;
        let snapshot = Image::from_envelope("get snapshot", &fetched.body)?;
        ensure_eq("snapshot name", SNAPSHOT_NAME, snapshot.name.as_str())?;
        let suffix = format!("/{}", server.id);
        ensure(
            snapshot
                .server_href()
                .is_some_and(|href| href.ends_with(&suffix)),
            format!(
                "snapshot server link {:?} does not end with {suffix}",
                snapshot.server_href()
            ),
        )?;

        ctx.wait_for_image(&snapshot.id, "ACTIVE").await?;
        ledger.release_image(ctx.api(), &snapshot_id).await
    })
}

/// Attempts to snapshot a server that is still building.
pub fn snapshot_server_inactive<'a, A, T>(
    ctx: &'a SuiteContext<A, T>,
    ledger: &'a mut ResourceLedger,
) -> ScenarioFuture<'a>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    Box::pin(async move {
        let server = ctx.provision_server(ledger, SERVER_NAME, None).await?;

        let response = ctx
            .api()
            .server_action(&server.id, &create_image_action())
            .await?;
        let location = response.location_id();
        if let Some(snapshot_id) = &location {
            ledger.record_image(snapshot_id.clone());
        }
        let expected = ctx
            .issues()
            .pick(KnownIssue::SnapshotBuildingServer, 202, 400);
        expect_status("createImage on a building server", &response, expected)?;

        if !(200..300).contains(&response.status) {
            return Ok(());
        }
        let snapshot_id = location.ok_or_else(|| {
            ScenarioError::Assertion(String::from(
                "createImage on a building server was accepted without a Location",
            ))
        })?;
        ledger.release_image(ctx.api(), &snapshot_id).await
    })
}
