//! Image listing and snapshots through `POST /images`.

use serde_json::{Value, json};
use tracing::info;

use super::assert::{array, ensure_eq, expect_keys, expect_status, member};
use super::{ResourceLedger, ScenarioError, ScenarioFuture, SuiteContext, SuiteTransport};
use crate::compute::{ApiRequest, ApiResponse, ComputeApi, Image, ImageRequest};
use crate::known_issues::KnownIssue;

const SERVER_NAME: &str = "testserver";
const SNAPSHOT_NAME: &str = "backup";

const BASIC_KEYS: &[&str] = &["id", "name", "links"];
const DETAILED_KEYS: &[&str] = &[
    "id", "name", "created", "updated", "status", "metadata", "links",
];

fn check_links<A, T>(ctx: &SuiteContext<A, T>, image: &Value) -> Result<(), ScenarioError>
where
    A: ComputeApi,
    T: SuiteTransport,
{
    if !ctx.issues().is_fixed(KnownIssue::ImageLinks) {
        return Ok(());
    }
    let id = match member("image", image, "id")? {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let compute = &ctx.config().compute;
    let expected = json!([
        { "rel": "self", "href": format!("{}/images/{id}", compute.api_root()) },
        { "rel": "bookmark", "href": format!("{}/images/{id}", compute.bookmark_root()) },
    ]);
    ensure_eq(
        &format!("links of image {id}"),
        &expected,
        member("image", image, "links")?,
    )
}

fn check_listing<A, T>(
    ctx: &SuiteContext<A, T>,
    what: &str,
    response: &ApiResponse,
    keys: &[&str],
) -> Result<(), ScenarioError>
where
    A: ComputeApi,
    T: SuiteTransport,
{
    expect_status(what, response, 200)?;
    expect_keys(what, &response.body, &["images"])?;
    for image in array(what, &response.body, "images")? {
        expect_keys(&format!("{what} entry"), image, keys)?;
        check_links(ctx, image)?;
    }
    Ok(())
}

/// Lists images and checks the summary shape of every entry.
pub fn index<'a, A, T>(
    ctx: &'a SuiteContext<A, T>,
    _ledger: &'a mut ResourceLedger,
) -> ScenarioFuture<'a>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    Box::pin(async move {
        let response = ctx.api().send(ApiRequest::get("/images")).await?;
        check_listing(ctx, "image index", &response, BASIC_KEYS)
    })
}

/// Lists images in detail and checks the shape of every entry.
pub fn detail<'a, A, T>(
    ctx: &'a SuiteContext<A, T>,
    _ledger: &'a mut ResourceLedger,
) -> ScenarioFuture<'a>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    Box::pin(async move {
        let response = ctx.api().send(ApiRequest::get("/images/detail")).await?;
        check_listing(ctx, "image detail", &response, DETAILED_KEYS)
    })
}

async fn request_snapshot<A: ComputeApi + ?Sized>(
    api: &A,
    server_ref: String,
) -> Result<ApiResponse, ScenarioError> {
    let request = ImageRequest {
        name: SNAPSHOT_NAME.to_owned(),
        server_ref,
    };
    Ok(api
        .send(ApiRequest::post("/images", request.to_body()))
        .await?)
}

/// Splits a create response into the image entity without its `server`
/// member, that member, and the parsed image.
fn split_created_image(body: &Value) -> Result<(Value, Option<Value>, Image), ScenarioError> {
    let mut entity = member("create image", body, "image")?.clone();
    let source = entity
        .as_object_mut()
        .and_then(|object| object.remove("server"));
    let image = Image::from_envelope("create image", &json!({ "image": &entity }))?;
    Ok((entity, source, image))
}

/// Snapshots an `ACTIVE` server referenced by its full URL.
pub fn snapshot_active_server<'a, A, T>(
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

        let server_ref = format!("{}/servers/{}", ctx.config().compute.api_root(), server.id);
        let response = request_snapshot(ctx.api(), server_ref.clone()).await?;
        let expected = ctx.issues().pick(KnownIssue::CreateImageStatus, 200, 202);
        expect_status("create image", &response, expected)?;
        expect_keys("create image", &response.body, &["image"])?;
        let (entity, source, snapshot) = split_created_image(&response.body)?;
        ledger.record_image(snapshot.id.clone());
        info!(server = %server.id, image = %snapshot.id, "snapshot requested");

        if ctx.issues().is_fixed(KnownIssue::SnapshotServerRef) {
            ensure_eq(
                "snapshot serverRef",
                &Some(Value::String(server_ref)),
                &source,
            )?;
        }
        expect_keys("created image", &entity, DETAILED_KEYS)?;
        check_links(ctx, &entity)?;
        ensure_eq("snapshot name", SNAPSHOT_NAME, snapshot.name.as_str())?;

        ctx.wait_for_image(&snapshot.id, "ACTIVE").await?;
        ledger.release_image(ctx.api(), &snapshot.id).await
    })
}

/// Attempts to snapshot a server that is still building, referenced by id.
pub fn snapshot_server_not_active<'a, A, T>(
    ctx: &'a SuiteContext<A, T>,
    ledger: &'a mut ResourceLedger,
) -> ScenarioFuture<'a>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    Box::pin(async move {
        let server = ctx.provision_server(ledger, SERVER_NAME, None).await?;

        let response = request_snapshot(ctx.api(), server.id.to_string()).await?;
        let snapshot_id = if (200..300).contains(&response.status) {
            let (_, _, snapshot) = split_created_image(&response.body)?;
            ledger.record_image(snapshot.id.clone());
            Some(snapshot.id)
        } else {
            None
        };
        let expected = ctx
            .issues()
            .pick(KnownIssue::SnapshotBuildingServer, 200, 400);
        expect_status("create image from a building server", &response, expected)?;

        if let Some(id) = snapshot_id {
            ledger.release_image(ctx.api(), &id).await?;
        }
        Ok(())
    })
}
