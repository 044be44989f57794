//! Unit tests for request rendering and the provided [`ComputeApi`] helpers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use rstest::rstest;
use serde_json::json;

use super::*;
use crate::wait::StatusWaiter;

#[derive(Default)]
struct CannedApi {
    responses: Mutex<VecDeque<ApiResponse>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl CannedApi {
    fn with(responses: impl IntoIterator<Item = ApiResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::default(),
        }
    }

    fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

impl ComputeApi for CannedApi {
    fn send(&self, request: ApiRequest) -> ComputeFuture<'_, ApiResponse> {
        self.requests.lock().expect("lock").push(request.clone());
        let next = self.responses.lock().expect("lock").pop_front();
        Box::pin(async move {
            next.ok_or_else(|| ComputeError::Transport {
                method: request.method.to_string(),
                path: request.path,
                message: String::from("no canned response"),
            })
        })
    }
}

fn response(status: u16, body: Value) -> ApiResponse {
    ApiResponse {
        status,
        location: None,
        body,
    }
}

fn server_body(status: &str) -> Value {
    json!({
        "server": {
            "id": 42,
            "name": "stacktester1",
            "status": status,
            "addresses": {"public": [{"addr": "10.0.0.5", "version": 4}]},
            "image": {"id": 3, "links": [{"rel": "self", "href": "http://nova/v1.1/images/3"}]},
            "flavor": {"id": "1", "links": []},
            "metadata": {"1234": "5678"}
        }
    })
}

#[test]
fn server_request_body_includes_admin_pass_only_when_set() {
    let plain = ServerRequest::builder()
        .name("stacktester1")
        .image_ref("3")
        .flavor_ref("1")
        .build()
        .expect("request");
    let with_pass = ServerRequest::builder()
        .name("stacktester1")
        .image_ref("3")
        .flavor_ref("1")
        .admin_pass("testpwd")
        .build()
        .expect("request");

    assert_eq!(
        plain.to_body(),
        json!({"server": {"name": "stacktester1", "imageRef": "3", "flavorRef": "1"}})
    );
    assert_eq!(with_pass.to_body()["server"]["adminPass"], json!("testpwd"));
}

#[rstest]
#[case::name("", "3", "1", "name")]
#[case::image("x", " ", "1", "imageRef")]
#[case::flavor("x", "3", "", "flavorRef")]
fn server_request_builder_names_missing_field(
    #[case] name: &str,
    #[case] image: &str,
    #[case] flavor: &str,
    #[case] field: &str,
) {
    let err = ServerRequest::builder()
        .name(name)
        .image_ref(image)
        .flavor_ref(flavor)
        .build()
        .expect_err("missing field");

    assert_eq!(err, ComputeError::InvalidRequest(field.to_owned()));
}

#[rstest]
#[case::password(
    ServerAction::ChangePassword { admin_pass: String::from("test123") },
    json!({"changePassword": {"adminPass": "test123"}})
)]
#[case::soft(ServerAction::Reboot(RebootKind::Soft), json!({"reboot": {"type": "SOFT"}}))]
#[case::hard(ServerAction::Reboot(RebootKind::Hard), json!({"reboot": {"type": "HARD"}}))]
#[case::resize(
    ServerAction::Resize { flavor_ref: String::from("2") },
    json!({"resize": {"flavorRef": "2"}})
)]
#[case::confirm(ServerAction::ConfirmResize, json!({"confirmResize": null}))]
#[case::revert(ServerAction::RevertResize, json!({"revertResize": null}))]
#[case::snapshot(
    ServerAction::CreateImage { name: String::from("backup") },
    json!({"createImage": {"name": "backup"}})
)]
fn renders_action_bodies(#[case] action: ServerAction, #[case] expected: Value) {
    assert_eq!(action.to_body(), expected);
}

#[test]
fn rebuild_encodes_personality_contents() {
    let action = ServerAction::Rebuild(RebuildRequest {
        image_ref: String::from("4"),
        name: Some(String::from("stacktester2")),
        metadata: Some(BTreeMap::from([(String::from("1234"), String::from("5678"))])),
        personality: vec![PersonalityFile {
            path: String::from("/tmp/asdf"),
            contents: String::from("XXX"),
        }],
        admin_pass: None,
    });

    assert_eq!(
        action.to_body(),
        json!({"rebuild": {
            "imageRef": "4",
            "name": "stacktester2",
            "metadata": {"1234": "5678"},
            "personality": [{"path": "/tmp/asdf", "contents": "WFhY"}]
        }})
    );
}

#[test]
fn server_view_exposes_address_image_and_flavor() {
    let server = Server::from_envelope("test", &server_body("ACTIVE")).expect("server");

    assert_eq!(server.id.as_str(), "42");
    assert_eq!(server.public_address(), Some("10.0.0.5"));
    assert!(server.runs_image("3"));
    assert!(server.runs_image("http://nova/v1.1/images/3"));
    assert!(!server.runs_image("4"));
    assert_eq!(server.flavor_id(), Some("1"));
}

#[test]
fn missing_envelope_is_malformed() {
    let err = Server::from_envelope("get server 1", &json!({"image": {}})).expect_err("no server");

    assert!(matches!(err, ComputeError::MalformedResponse { .. }), "{err:?}");
}

#[rstest]
#[case::plain(Some("http://nova/v1.1/images/77"), Some("77"))]
#[case::trailing_slash(Some("http://nova/v1.1/images/77/"), Some("77"))]
#[case::absent(None, None)]
fn location_id_takes_last_segment(#[case] location: Option<&str>, #[case] expected: Option<&str>) {
    let response = ApiResponse {
        status: 202,
        location: location.map(str::to_owned),
        body: Value::Null,
    };

    assert_eq!(response.location_id(), expected.map(ResourceHandle::from));
}

#[tokio::test]
async fn get_server_rejects_unexpected_status() {
    let api = CannedApi::with([response(404, json!({"itemNotFound": {}}))]);

    let err = api
        .get_server(&ResourceHandle::from("9"))
        .await
        .expect_err("404");

    assert!(err.is_not_found());
}

#[tokio::test]
async fn server_action_posts_to_action_path() {
    let api = CannedApi::with([response(202, Value::Null)]);
    let id = ResourceHandle::from("42");

    let reply = api
        .server_action(&id, &ServerAction::Reboot(RebootKind::Soft))
        .await
        .expect("response");

    assert_eq!(reply.status, 202);
    let requests = api.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(requests[0].path, "/servers/42/action");
}

#[tokio::test(start_paused = true)]
async fn server_status_adapter_drives_waiter() {
    let api = CannedApi::with([
        response(200, server_body("BUILD")),
        response(200, server_body("BUILD")),
        response(200, server_body("ACTIVE")),
    ]);
    let waiter = StatusWaiter::default();

    let outcome = waiter
        .wait(&ServerStatus(&api), &ResourceHandle::from("42"), "ACTIVE")
        .await
        .expect("active");

    assert_eq!(outcome.polls, 3);
    assert!(
        api.requests()
            .iter()
            .all(|request| request.path == "/servers/42")
    );
}
