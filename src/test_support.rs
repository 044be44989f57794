//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedTransport`] replays queued transport results, [`SimulatedEndpoint`]
//! behaves like a host that can be rebooted, and [`FakeCloud`] serves the
//! compute API in memory with one simulated host per server.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future::ready;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::{Instant, sleep, sleep_until};
use uuid::Uuid;

use crate::compute::{ApiRequest, ApiResponse, ComputeApi, ComputeFuture};
use crate::config::{ComputeConfig, EnvironmentConfig, SshConfig, SuiteConfig};
use crate::known_issues::{KnownIssue, KnownIssues};
use crate::session::{
    CommandOutput, HoldOutcome, RemoteCommand, SessionCredential, Transport, TransportError,
    TransportFuture,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Operation observed by a [`ScriptedTransport`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportCall {
    /// `connect` was called.
    Connect,
    /// `execute` was called with the rendered command.
    Execute(String),
    /// `hold` was called.
    Hold,
}

#[derive(Debug, Default)]
struct Script {
    connects: VecDeque<Result<(), TransportError>>,
    executes: VecDeque<Result<CommandOutput, TransportError>>,
    holds: VecDeque<Result<HoldOutcome, TransportError>>,
    calls: Vec<TransportCall>,
}

/// Transport returning pre-seeded results in FIFO order.
///
/// Clones share one script, so a test can keep a handle for assertions after
/// moving the transport into a session. An empty connect queue reports the
/// endpoint unreachable; other empty queues report a spawn failure.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    /// Creates a transport with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the result of the next `connect`.
    pub fn push_connect(&self, result: Result<(), TransportError>) {
        lock(&self.script).connects.push_back(result);
    }

    /// Queues a successful `execute` with the given exit code and stdout.
    pub fn push_output(&self, code: Option<i32>, stdout: &str) {
        self.push_execute(Ok(CommandOutput {
            code,
            stdout: stdout.to_owned(),
            stderr: String::new(),
        }));
    }

    /// Queues the result of the next `execute`.
    pub fn push_execute(&self, result: Result<CommandOutput, TransportError>) {
        lock(&self.script).executes.push_back(result);
    }

    /// Queues the result of the next `hold`.
    pub fn push_hold(&self, result: Result<HoldOutcome, TransportError>) {
        lock(&self.script).holds.push_back(result);
    }

    /// Returns every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.script).calls.clone()
    }
}

fn unscripted(operation: &str) -> TransportError {
    TransportError::Spawn {
        program: operation.to_owned(),
        message: String::from("no scripted response"),
    }
}

impl Transport for ScriptedTransport {
    fn connect<'a>(
        &'a self,
        _credential: &'a SessionCredential,
        _timeout: Duration,
    ) -> TransportFuture<'a, ()> {
        let mut script = lock(&self.script);
        script.calls.push(TransportCall::Connect);
        let result = script.connects.pop_front().unwrap_or_else(|| {
            Err(TransportError::Unreachable {
                message: String::from("no scripted connect"),
            })
        });
        Box::pin(ready(result))
    }

    fn execute<'a>(
        &'a self,
        _credential: &'a SessionCredential,
        command: &'a RemoteCommand,
        _timeout: Duration,
    ) -> TransportFuture<'a, CommandOutput> {
        let mut script = lock(&self.script);
        script.calls.push(TransportCall::Execute(command.render()));
        let result = script
            .executes
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("execute")));
        Box::pin(ready(result))
    }

    fn hold<'a>(
        &'a self,
        _credential: &'a SessionCredential,
        _limit: Duration,
    ) -> TransportFuture<'a, HoldOutcome> {
        let mut script = lock(&self.script);
        script.calls.push(TransportCall::Hold);
        let result = script
            .holds
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("hold")));
        Box::pin(ready(result))
    }
}

/// Uptime a simulated host reports before its first reboot.
const INITIAL_UPTIME: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug)]
struct Outage {
    starts: Instant,
    ends: Instant,
}

#[derive(Debug)]
struct HostState {
    password: String,
    files: BTreeMap<String, String>,
    outage: Option<Outage>,
    booted_at: Instant,
    uptime_at_boot: Duration,
}

impl HostState {
    /// Completes an outage whose end has passed, which counts as a boot.
    fn refresh(&mut self, now: Instant) {
        if let Some(outage) = self.outage
            && outage.ends <= now
        {
            self.booted_at = outage.ends;
            self.uptime_at_boot = Duration::ZERO;
            self.outage = None;
        }
    }

    fn is_down(&self, now: Instant) -> bool {
        self.outage
            .is_some_and(|outage| outage.starts <= now && now < outage.ends)
    }

    fn admit(&mut self, credential: &SessionCredential) -> Result<(), TransportError> {
        let now = Instant::now();
        self.refresh(now);
        if self.is_down(now) {
            return Err(TransportError::Unreachable {
                message: String::from("Connection refused"),
            });
        }
        if credential.secret().expose() != self.password {
            return Err(TransportError::Rejected {
                message: String::from("Permission denied"),
            });
        }
        Ok(())
    }

    fn uptime(&self) -> Duration {
        self.uptime_at_boot + Instant::now().saturating_duration_since(self.booted_at)
    }

    fn run(&mut self, command: &RemoteCommand) -> CommandOutput {
        let (code, stdout) = match command {
            RemoteCommand::ReadFile { path } => self
                .files
                .get(path.as_str())
                .map_or((1, String::new()), |contents| (0, contents.clone())),
            RemoteCommand::WriteFile { path, contents } => {
                self.files.insert(path.as_str().to_owned(), contents.clone());
                (0, String::new())
            }
            RemoteCommand::ReadUptime => {
                let uptime = self.uptime();
                let field = format!("{}.{:03}", uptime.as_secs(), uptime.subsec_millis());
                (0, format!("{field} {field}\n"))
            }
            RemoteCommand::Noop | RemoteCommand::Hold { .. } => (0, String::new()),
        };
        CommandOutput {
            code: Some(code),
            stdout,
            stderr: String::new(),
        }
    }
}

/// In-memory host with a password, a file system and a reboot schedule.
///
/// Time is read from the tokio clock, so tests usually run with a paused
/// runtime.
#[derive(Clone, Debug)]
pub struct SimulatedEndpoint {
    state: Arc<Mutex<HostState>>,
}

impl SimulatedEndpoint {
    /// Creates a running host accepting `password`.
    #[must_use]
    pub fn new(password: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                password: password.to_owned(),
                files: BTreeMap::new(),
                outage: None,
                booted_at: Instant::now(),
                uptime_at_boot: INITIAL_UPTIME,
            })),
        }
    }

    /// Takes the host down `after` from now for `length`; it boots afresh
    /// when the outage ends.
    pub fn schedule_outage(&self, after: Duration, length: Duration) {
        let now = Instant::now();
        let starts = now + after;
        let mut state = lock(&self.state);
        state.refresh(now);
        state.outage = Some(Outage {
            starts,
            ends: starts + length,
        });
    }

    /// Replaces the accepted password.
    pub fn set_password(&self, password: &str) {
        password.clone_into(&mut lock(&self.state).password);
    }

    /// Removes every file, as a reinstall does.
    pub fn wipe_files(&self) {
        lock(&self.state).files.clear();
    }

    /// Places a file on the host.
    pub fn put_file(&self, path: &str, contents: &str) {
        lock(&self.state)
            .files
            .insert(path.to_owned(), contents.to_owned());
    }

    /// Returns the contents of `path`, if present.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<String> {
        lock(&self.state).files.get(path).cloned()
    }
}

impl Transport for SimulatedEndpoint {
    fn connect<'a>(
        &'a self,
        credential: &'a SessionCredential,
        _timeout: Duration,
    ) -> TransportFuture<'a, ()> {
        let result = lock(&self.state).admit(credential);
        Box::pin(ready(result))
    }

    fn execute<'a>(
        &'a self,
        credential: &'a SessionCredential,
        command: &'a RemoteCommand,
        _timeout: Duration,
    ) -> TransportFuture<'a, CommandOutput> {
        let mut state = lock(&self.state);
        let result = state.admit(credential).map(|()| state.run(command));
        Box::pin(ready(result))
    }

    fn hold<'a>(
        &'a self,
        credential: &'a SessionCredential,
        limit: Duration,
    ) -> TransportFuture<'a, HoldOutcome> {
        let now = Instant::now();
        let next_drop = {
            let mut state = lock(&self.state);
            state.refresh(now);
            if state.is_down(now) {
                return Box::pin(ready(Ok(HoldOutcome::Unreachable)));
            }
            if credential.secret().expose() != state.password {
                return Box::pin(ready(Err(TransportError::Rejected {
                    message: String::from("Permission denied"),
                })));
            }
            state.outage.map(|outage| outage.starts)
        };
        Box::pin(async move {
            match next_drop {
                Some(starts) if starts <= now + limit => {
                    sleep_until(starts).await;
                    Ok(HoldOutcome::Dropped)
                }
                _ => {
                    sleep(limit).await;
                    Ok(HoldOutcome::StillOpen)
                }
            }
        })
    }
}

/// Transport routing each credential to the simulated host at its address.
#[derive(Clone, Debug, Default)]
pub struct FakeHosts {
    endpoints: Arc<Mutex<BTreeMap<String, SimulatedEndpoint>>>,
}

impl FakeHosts {
    fn insert(&self, address: &str, endpoint: SimulatedEndpoint) {
        lock(&self.endpoints).insert(address.to_owned(), endpoint);
    }

    fn remove(&self, address: &str) {
        lock(&self.endpoints).remove(address);
    }

    /// Returns the host at `address`, if one is running.
    #[must_use]
    pub fn endpoint(&self, address: &str) -> Option<SimulatedEndpoint> {
        lock(&self.endpoints).get(address).cloned()
    }
}

fn no_route(credential: &SessionCredential) -> TransportError {
    TransportError::Unreachable {
        message: format!("No route to host {}", credential.address()),
    }
}

impl Transport for FakeHosts {
    fn connect<'a>(
        &'a self,
        credential: &'a SessionCredential,
        timeout: Duration,
    ) -> TransportFuture<'a, ()> {
        let endpoint = self.endpoint(credential.address());
        Box::pin(async move {
            match endpoint {
                Some(host) => host.connect(credential, timeout).await,
                None => Err(no_route(credential)),
            }
        })
    }

    fn execute<'a>(
        &'a self,
        credential: &'a SessionCredential,
        command: &'a RemoteCommand,
        timeout: Duration,
    ) -> TransportFuture<'a, CommandOutput> {
        let endpoint = self.endpoint(credential.address());
        Box::pin(async move {
            match endpoint {
                Some(host) => host.execute(credential, command, timeout).await,
                None => Err(no_route(credential)),
            }
        })
    }

    fn hold<'a>(
        &'a self,
        credential: &'a SessionCredential,
        limit: Duration,
    ) -> TransportFuture<'a, HoldOutcome> {
        let endpoint = self.endpoint(credential.address());
        Box::pin(async move {
            match endpoint {
                Some(host) => host.hold(credential, limit).await,
                None => Err(no_route(credential)),
            }
        })
    }
}

/// Host name the fake compute API answers for.
pub const FAKE_HOST: &str = "nova.test";

/// Builds a complete configuration pointing at [`FakeCloud`].
#[must_use]
pub fn fake_suite_config() -> SuiteConfig {
    SuiteConfig {
        compute: ComputeConfig {
            scheme: String::from("http"),
            host: FAKE_HOST.to_owned(),
            port: 8774,
            base_url: String::from("v1.1"),
            auth_token: String::from("fake-token"),
            build_timeout_secs: 600,
            poll_interval_secs: 1,
            request_timeout_secs: 30,
        },
        environment: EnvironmentConfig {
            image_ref: String::from("1"),
            image_ref_alt: String::from("2"),
            flavor_ref: String::from("1"),
            flavor_ref_alt: String::from("2"),
            multi_node: false,
            fixed_issues: String::new(),
        },
        ssh: SshConfig {
            ssh_bin: String::from("ssh"),
            sshpass_bin: String::from("sshpass"),
            login: String::from("root"),
            port: 22,
            connect_timeout_secs: 5,
            cycle_timeout_secs: 120,
            probe_interval_secs: 1,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
        },
    }
}

/// Delay between a reboot request and the host going down.
const REBOOT_DELAY: Duration = Duration::from_secs(2);
/// How long a rebooting host stays unreachable.
const REBOOT_DOWNTIME: Duration = Duration::from_secs(5);

/// How long a freshly built or rebuilt host refuses logins. It outlasts the
/// single status poll that takes a server to `ACTIVE`.
const SSHD_STARTUP: Duration = Duration::from_secs(3);
const TIMESTAMP: &str = "2011-06-01T00:00:00Z";

#[derive(Debug)]
struct FakeServer {
    name: String,
    statuses: VecDeque<String>,
    address: String,
    image_ref: String,
    flavor_ref: String,
    flavor_before_resize: Option<String>,
    metadata: BTreeMap<String, String>,
    host: SimulatedEndpoint,
}

#[derive(Debug)]
struct FakeImage {
    name: String,
    statuses: VecDeque<String>,
    server: Option<String>,
}

#[derive(Clone, Copy, Debug)]
struct FakeFlavor {
    name: &'static str,
    ram: u64,
    disk: u64,
}

#[derive(Debug)]
struct CloudState {
    api_root: String,
    bookmark_root: String,
    fixed: KnownIssues,
    servers: BTreeMap<String, FakeServer>,
    images: BTreeMap<String, FakeImage>,
    flavors: BTreeMap<&'static str, FakeFlavor>,
    hosts_created: u32,
    failing_actions: BTreeMap<String, u16>,
    failing_deletes: bool,
    failing_image_fetch: Option<u16>,
    omit_locations: bool,
    requests: Vec<String>,
}

/// Reads the current status, moving past it unless it is the last one.
fn advance(statuses: &mut VecDeque<String>) -> String {
    if statuses.len() > 1 {
        statuses.pop_front().unwrap_or_default()
    } else {
        statuses.front().cloned().unwrap_or_default()
    }
}

fn statuses(states: &[&str]) -> VecDeque<String> {
    states.iter().map(|state| (*state).to_owned()).collect()
}

fn reply(status: u16, body: Value) -> ApiResponse {
    ApiResponse {
        status,
        location: None,
        body,
    }
}

fn fault(status: u16, message: &str) -> ApiResponse {
    let kind = match status {
        400 => "badRequest",
        404 => "itemNotFound",
        _ => "computeFault",
    };
    reply(status, json!({ kind: { "code": status, "message": message } }))
}

fn last_segment(reference: &str) -> &str {
    reference
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(reference)
}

fn is_building(server: &FakeServer) -> bool {
    server
        .statuses
        .front()
        .is_some_and(|status| status == "BUILD")
}

fn string_at<'v>(value: &'v Value, pointer: &str) -> Option<&'v str> {
    value.pointer(pointer).and_then(Value::as_str)
}

impl CloudState {
    fn pick(&self, issue: KnownIssue, tolerated: &'static str, fixed: &'static str) -> &'static str {
        self.fixed.pick(issue, tolerated, fixed)
    }

    fn server_view(&self, id: &str, server: &FakeServer, status: &str) -> Value {
        json!({
            "id": id,
            "name": server.name,
            "status": status,
            "addresses": { "public": [{ "addr": server.address, "version": 4 }] },
            "image": {
                "id": server.image_ref,
                "links": [{ "rel": "bookmark", "href": format!("{}/images/{}", self.bookmark_root, server.image_ref) }],
            },
            "flavor": {
                "id": server.flavor_ref,
                "links": [{ "rel": "bookmark", "href": format!("{}/flavors/{}", self.bookmark_root, server.flavor_ref) }],
            },
            "metadata": server.metadata,
            "links": self.server_links(id),
        })
    }

    fn server_links(&self, id: &str) -> Value {
        json!([
            { "rel": "self", "href": format!("{}/servers/{id}", self.api_root) },
            { "rel": "bookmark", "href": format!("{}/servers/{id}", self.bookmark_root) },
        ])
    }

    fn image_links(&self, id: &str) -> Value {
        let own = json!({ "rel": "self", "href": format!("{}/images/{id}", self.api_root) });
        if self.fixed.is_fixed(KnownIssue::ImageLinks) {
            json!([
                own,
                { "rel": "bookmark", "href": format!("{}/images/{id}", self.bookmark_root) },
            ])
        } else {
            json!([own])
        }
    }

    fn image_view(&self, id: &str, image: &FakeImage, status: &str) -> Value {
        json!({
            "id": id,
            "name": image.name,
            "created": TIMESTAMP,
            "updated": TIMESTAMP,
            "status": status,
            "metadata": {},
            "links": self.image_links(id),
        })
    }

    fn with_source(&self, mut view: Value, server_id: &str) -> Value {
        if let Some(object) = view.as_object_mut() {
            object.insert(
                String::from("server"),
                json!({ "id": server_id, "links": self.server_links(server_id) }),
            );
        }
        view
    }

    fn handle(&mut self, hosts: &FakeHosts, request: &ApiRequest) -> ApiResponse {
        self.requests
            .push(format!("{} {}", request.method, request.path));
        let body = request.body.clone().unwrap_or(Value::Null);
        let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();
        match (request.method.as_str(), segments.as_slice()) {
            ("POST", ["servers"]) => self.create_server(hosts, &body),
            ("GET", ["servers", id]) => self.get_server(id),
            ("DELETE", ["servers", id]) => self.delete_server(hosts, id),
            ("POST", ["servers", id, "action"]) => self.server_action(id, &body),
            ("GET", ["images"]) => self.list_images(false),
            ("GET", ["images", "detail"]) => self.list_images(true),
            ("GET", ["images", id]) => self.get_image(id),
            ("POST", ["images"]) => self.create_image(&body),
            ("DELETE", ["images", id]) => self.delete_image(id),
            ("GET", ["flavors", id]) => self.get_flavor(id),
            _ => fault(404, "no such route"),
        }
    }

    fn create_server(&mut self, hosts: &FakeHosts, body: &Value) -> ApiResponse {
        let (Some(name), Some(image_ref), Some(flavor_ref)) = (
            string_at(body, "/server/name"),
            string_at(body, "/server/imageRef"),
            string_at(body, "/server/flavorRef"),
        ) else {
            return fault(400, "name, imageRef and flavorRef are required");
        };
        let password = string_at(body, "/server/adminPass")
            .map_or_else(|| Uuid::new_v4().simple().to_string(), str::to_owned);
        self.hosts_created += 1;
        let address = format!("10.0.0.{}", self.hosts_created);
        let host = SimulatedEndpoint::new(&password);
        host.schedule_outage(Duration::ZERO, SSHD_STARTUP);
        hosts.insert(&address, host.clone());

        let id = Uuid::new_v4().to_string();
        let server = FakeServer {
            name: name.to_owned(),
            statuses: statuses(&["BUILD", "ACTIVE"]),
            address,
            image_ref: last_segment(image_ref).to_owned(),
            flavor_ref: last_segment(flavor_ref).to_owned(),
            flavor_before_resize: None,
            metadata: BTreeMap::new(),
            host,
        };
        let mut view = self.server_view(&id, &server, "BUILD");
        if let Some(object) = view.as_object_mut() {
            object.insert(String::from("adminPass"), json!(password));
        }
        self.servers.insert(id, server);
        reply(202, json!({ "server": view }))
    }

    fn get_server(&mut self, id: &str) -> ApiResponse {
        let Some(mut server) = self.servers.remove(id) else {
            return fault(404, "server not found");
        };
        let status = advance(&mut server.statuses);
        let view = self.server_view(id, &server, &status);
        self.servers.insert(id.to_owned(), server);
        reply(200, json!({ "server": view }))
    }

    fn delete_server(&mut self, hosts: &FakeHosts, id: &str) -> ApiResponse {
        if self.failing_deletes {
            return fault(500, "delete refused");
        }
        match self.servers.remove(id) {
            Some(server) => {
                hosts.remove(&server.address);
                reply(204, Value::Null)
            }
            None => fault(404, "server not found"),
        }
    }

    fn server_action(&mut self, id: &str, body: &Value) -> ApiResponse {
        let Some((action, arguments)) = body.as_object().and_then(|object| object.iter().next())
        else {
            return fault(400, "malformed action");
        };
        if let Some(status) = self.failing_actions.remove(action) {
            return fault(status, "injected failure");
        }
        let Some(mut server) = self.servers.remove(id) else {
            return fault(404, "server not found");
        };
        let response = self.apply_action(id, &mut server, action, arguments);
        self.servers.insert(id.to_owned(), server);
        response
    }

    fn apply_action(
        &mut self,
        id: &str,
        server: &mut FakeServer,
        action: &str,
        arguments: &Value,
    ) -> ApiResponse {
        match action {
            "changePassword" => self.change_password(server, arguments),
            "reboot" => self.reboot(server, arguments),
            "rebuild" => self.rebuild(id, server, arguments),
            "resize" => self.resize(server, arguments),
            "confirmResize" => {
                server.flavor_before_resize = None;
                server.statuses = statuses(&["ACTIVE"]);
                reply(204, Value::Null)
            }
            "revertResize" => {
                if let Some(original) = server.flavor_before_resize.take() {
                    server.flavor_ref = original;
                }
                server.statuses = statuses(&["ACTIVE"]);
                reply(202, Value::Null)
            }
            "createImage" => self.snapshot_action(id, server, arguments),
            _ => fault(400, "unsupported action"),
        }
    }

    fn change_password(&self, server: &mut FakeServer, arguments: &Value) -> ApiResponse {
        let Some(password) = string_at(arguments, "/adminPass") else {
            return fault(400, "adminPass is required");
        };
        server.host.set_password(password);
        server.statuses = if self.fixed.is_fixed(KnownIssue::PasswordStatus) {
            statuses(&["PASSWORD", "ACTIVE"])
        } else {
            statuses(&["ACTIVE"])
        };
        reply(202, Value::Null)
    }

    fn reboot(&self, server: &mut FakeServer, arguments: &Value) -> ApiResponse {
        let (issue, transitional) = match string_at(arguments, "/type") {
            Some("HARD") => (KnownIssue::HardRebootStatus, "HARD_REBOOT"),
            _ => (KnownIssue::RebootStatus, "REBOOT"),
        };
        server.host.schedule_outage(REBOOT_DELAY, REBOOT_DOWNTIME);
        server.statuses = if self.fixed.is_fixed(issue) {
            statuses(&[transitional, "ACTIVE"])
        } else {
            statuses(&["ACTIVE"])
        };
        reply(202, Value::Null)
    }

    fn resize(&self, server: &mut FakeServer, arguments: &Value) -> ApiResponse {
        let Some(flavor_ref) = string_at(arguments, "/flavorRef") else {
            return fault(400, "flavorRef is required");
        };
        let pending = self.pick(KnownIssue::VerifyResizeStatus, "RESIZE-CONFIRM", "VERIFY_RESIZE");
        let original = std::mem::replace(&mut server.flavor_ref, last_segment(flavor_ref).to_owned());
        server.flavor_before_resize = Some(original);
        server.statuses = statuses(&["RESIZE", pending]);
        reply(202, Value::Null)
    }

    fn snapshot_action(&mut self, id: &str, server: &FakeServer, arguments: &Value) -> ApiResponse {
        if is_building(server) && self.fixed.is_fixed(KnownIssue::SnapshotBuildingServer) {
            return fault(400, "server is not active");
        }
        let name = string_at(arguments, "/name").unwrap_or("snapshot");
        let image_id = self.add_snapshot(name, id);
        let mut response = reply(202, Value::Null);
        if !self.omit_locations {
            response.location = Some(format!("{}/images/{image_id}", self.api_root));
        }
        response
    }

    fn rebuild(&self, id: &str, server: &mut FakeServer, arguments: &Value) -> ApiResponse {
        let Some(image_ref) = string_at(arguments, "/imageRef") else {
            return fault(400, "imageRef is required");
        };
        let password = string_at(arguments, "/adminPass")
            .map_or_else(|| Uuid::new_v4().simple().to_string(), str::to_owned);
        image_ref.clone_into(&mut server.image_ref);
        if let Some(name) = string_at(arguments, "/name") {
            name.clone_into(&mut server.name);
        }
        if let Some(metadata) = arguments.get("metadata").and_then(Value::as_object) {
            server.metadata = metadata
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|text| (key.clone(), text.to_owned())))
                .collect();
        }
        server.host.wipe_files();
        server.host.set_password(&password);
        server.host.schedule_outage(Duration::ZERO, SSHD_STARTUP);
        for file in arguments
            .get("personality")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let (Some(path), Some(encoded)) = (string_at(file, "/path"), string_at(file, "/contents"))
                && let Ok(decoded) = STANDARD.decode(encoded)
            {
                server.host.put_file(path, &String::from_utf8_lossy(&decoded));
            }
        }
        let transitional = self.pick(KnownIssue::RebuildStatus, "BUILD", "REBUILD");
        server.statuses = statuses(&[transitional, "ACTIVE"]);

        let mut view = self.server_view(id, server, transitional);
        if let Some(object) = view.as_object_mut() {
            object.insert(String::from("adminPass"), json!(password));
        }
        reply(202, json!({ "server": view }))
    }

    fn add_snapshot(&mut self, name: &str, server_id: &str) -> String {
        let image_id = Uuid::new_v4().to_string();
        self.images.insert(
            image_id.clone(),
            FakeImage {
                name: name.to_owned(),
                statuses: statuses(&["SAVING", "ACTIVE"]),
                server: Some(server_id.to_owned()),
            },
        );
        image_id
    }

    fn list_images(&self, detailed: bool) -> ApiResponse {
        let images: Vec<Value> = self
            .images
            .iter()
            .map(|(id, image)| {
                if detailed {
                    let status = image.statuses.front().cloned().unwrap_or_default();
                    self.image_view(id, image, &status)
                } else {
                    json!({ "id": id, "name": image.name, "links": self.image_links(id) })
                }
            })
            .collect();
        reply(200, json!({ "images": images }))
    }

    fn get_image(&mut self, id: &str) -> ApiResponse {
        if let Some(status) = self.failing_image_fetch.take() {
            return fault(status, "injected failure");
        }
        let Some(mut image) = self.images.remove(id) else {
            return fault(404, "image not found");
        };
        let status = advance(&mut image.statuses);
        let base = self.image_view(id, &image, &status);
        let view = match &image.server {
            Some(server_id) => self.with_source(base, server_id),
            None => base,
        };
        self.images.insert(id.to_owned(), image);
        reply(200, json!({ "image": view }))
    }

    fn create_image(&mut self, body: &Value) -> ApiResponse {
        let (Some(name), Some(server_ref)) = (
            string_at(body, "/image/name"),
            string_at(body, "/image/serverRef"),
        ) else {
            return fault(400, "name and serverRef are required");
        };
        let server_id = last_segment(server_ref).to_owned();
        let Some(server) = self.servers.get(&server_id) else {
            return fault(404, "server not found");
        };
        if is_building(server) && self.fixed.is_fixed(KnownIssue::SnapshotBuildingServer) {
            return fault(400, "server is not active");
        }
        let image_id = self.add_snapshot(name, &server_id);
        let view = self.images.get(&image_id).map_or(Value::Null, |image| {
            let base = self.image_view(&image_id, image, "SAVING");
            if self.fixed.is_fixed(KnownIssue::SnapshotServerRef) {
                let mut entity = base;
                if let Some(object) = entity.as_object_mut() {
                    object.insert(String::from("server"), json!(server_ref));
                }
                entity
            } else {
                self.with_source(base, &server_id)
            }
        });
        let status = if self.fixed.is_fixed(KnownIssue::CreateImageStatus) {
            202
        } else {
            200
        };
        reply(status, json!({ "image": view }))
    }

    fn delete_image(&mut self, id: &str) -> ApiResponse {
        if self.failing_deletes {
            return fault(500, "delete refused");
        }
        match self.images.remove(id) {
            Some(_) => reply(204, Value::Null),
            None => fault(404, "image not found"),
        }
    }

    fn get_flavor(&self, id: &str) -> ApiResponse {
        match self.flavors.get(id) {
            Some(flavor) => reply(
                200,
                json!({ "flavor": {
                    "id": id,
                    "name": flavor.name,
                    "ram": flavor.ram,
                    "disk": flavor.disk,
                    "links": [{ "rel": "self", "href": format!("{}/flavors/{id}", self.api_root) }],
                } }),
            ),
            None => fault(404, "flavor not found"),
        }
    }
}

/// In-memory compute API with one [`SimulatedEndpoint`] per server.
///
/// Servers build in one poll and refuse logins for a few seconds after
/// building or rebuilding. Reboots take the host down briefly, rebuilds
/// wipe files and inject personality, and snapshots save in one poll. Known
/// issues behave as on an unfixed deployment until [`FakeCloud::fix`] is
/// called. Base images `1` and `2` and flavors `1` and `2` always exist.
#[derive(Clone, Debug)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
    hosts: FakeHosts,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    /// Creates a cloud answering at the roots of [`fake_suite_config`].
    #[must_use]
    pub fn new() -> Self {
        let compute = fake_suite_config().compute;
        let base_image = |name: &str| FakeImage {
            name: name.to_owned(),
            statuses: statuses(&["ACTIVE"]),
            server: None,
        };
        let state = CloudState {
            api_root: compute.api_root(),
            bookmark_root: compute.bookmark_root(),
            fixed: KnownIssues::none_fixed(),
            servers: BTreeMap::new(),
            images: BTreeMap::from([
                (String::from("1"), base_image("primary")),
                (String::from("2"), base_image("alternate")),
            ]),
            flavors: BTreeMap::from([
                ("1", FakeFlavor { name: "m1.tiny", ram: 512, disk: 0 }),
                ("2", FakeFlavor { name: "m1.small", ram: 2048, disk: 20 }),
            ]),
            hosts_created: 0,
            failing_actions: BTreeMap::new(),
            failing_deletes: false,
            failing_image_fetch: None,
            omit_locations: false,
            requests: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            hosts: FakeHosts::default(),
        }
    }

    /// Transport reaching the hosts of this cloud's servers.
    #[must_use]
    pub fn hosts(&self) -> FakeHosts {
        self.hosts.clone()
    }

    /// Makes the cloud behave as if `issue` were fixed.
    pub fn fix(&self, issue: KnownIssue) {
        let mut state = lock(&self.state);
        state.fixed = state.fixed.clone().with_fixed(issue);
    }

    /// Fails the next server action named `action` with `status`.
    pub fn fail_next_action(&self, action: &str, status: u16) {
        lock(&self.state)
            .failing_actions
            .insert(action.to_owned(), status);
    }

    /// Fails the next `GET /images/{id}` with `status`.
    pub fn fail_next_image_fetch(&self, status: u16) {
        lock(&self.state).failing_image_fetch = Some(status);
    }

    /// Leaves the `Location` header off `createImage` responses while
    /// `omitting` is set.
    pub fn omit_snapshot_locations(&self, omitting: bool) {
        lock(&self.state).omit_locations = omitting;
    }

    /// Makes every delete fail with HTTP 500 while `failing` is set.
    pub fn fail_deletes(&self, failing: bool) {
        lock(&self.state).failing_deletes = failing;
    }

    /// Number of servers that exist.
    #[must_use]
    pub fn server_count(&self) -> usize {
        lock(&self.state).servers.len()
    }

    /// Number of snapshot images that exist.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        lock(&self.state)
            .images
            .values()
            .filter(|image| image.server.is_some())
            .count()
    }

    /// Every request received, as `METHOD path`.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        lock(&self.state).requests.clone()
    }
}

impl ComputeApi for FakeCloud {
    fn send(&self, request: ApiRequest) -> ComputeFuture<'_, ApiResponse> {
        let response = lock(&self.state).handle(&self.hosts, &request);
        Box::pin(ready(Ok(response)))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and clears environment variables while holding a global mutex.
    ///
    /// `None` removes the variable for the guard's lifetime.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(text) => env::set_var(key, text),
                    None => env::remove_var(key),
                }
            }
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
