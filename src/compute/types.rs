//! Request bodies and response views for the compute API.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::error::ComputeError;
use crate::handle::ResourceHandle;

/// Parameters for creating a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerRequest {
    /// Display name.
    pub name: String,
    /// Image reference (id or URL).
    pub image_ref: String,
    /// Flavor reference (id or URL).
    pub flavor_ref: String,
    /// Optional root password; the API generates one when absent.
    pub admin_pass: Option<String>,
}

impl ServerRequest {
    /// Starts a builder for a [`ServerRequest`].
    #[must_use]
    pub fn builder() -> ServerRequestBuilder {
        ServerRequestBuilder::default()
    }

    /// Renders the `{"server": {...}}` request body.
    #[must_use]
    pub fn to_body(&self) -> Value {
        let mut server = Map::new();
        server.insert(String::from("name"), json!(self.name));
        server.insert(String::from("imageRef"), json!(self.image_ref));
        server.insert(String::from("flavorRef"), json!(self.flavor_ref));
        if let Some(pass) = &self.admin_pass {
            server.insert(String::from("adminPass"), json!(pass));
        }
        json!({ "server": server })
    }
}

/// Builder for [`ServerRequest`] that trims and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerRequestBuilder {
    name: String,
    image_ref: String,
    flavor_ref: String,
    admin_pass: Option<String>,
}

impl ServerRequestBuilder {
    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the image reference.
    #[must_use]
    pub fn image_ref(mut self, value: impl Into<String>) -> Self {
        self.image_ref = value.into();
        self
    }

    /// Sets the flavor reference.
    #[must_use]
    pub fn flavor_ref(mut self, value: impl Into<String>) -> Self {
        self.flavor_ref = value.into();
        self
    }

    /// Sets the root password.
    #[must_use]
    pub fn admin_pass(mut self, value: impl Into<String>) -> Self {
        self.admin_pass = Some(value.into());
        self
    }

    /// Builds the request.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::InvalidRequest`] naming the first empty
    /// required field.
    pub fn build(self) -> Result<ServerRequest, ComputeError> {
        let request = ServerRequest {
            name: self.name.trim().to_owned(),
            image_ref: self.image_ref.trim().to_owned(),
            flavor_ref: self.flavor_ref.trim().to_owned(),
            admin_pass: self.admin_pass,
        };
        for (field, value) in [
            ("name", &request.name),
            ("imageRef", &request.image_ref),
            ("flavorRef", &request.flavor_ref),
        ] {
            if value.is_empty() {
                return Err(ComputeError::InvalidRequest(field.to_owned()));
            }
        }
        Ok(request)
    }
}

/// Reboot flavour.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RebootKind {
    /// Guest-initiated restart.
    Soft,
    /// Power cycle.
    Hard,
}

impl RebootKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Soft => "SOFT",
            Self::Hard => "HARD",
        }
    }
}

/// File injected into a server at rebuild time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PersonalityFile {
    /// Absolute path inside the guest.
    pub path: String,
    /// Plain-text contents; encoded when the body is rendered.
    pub contents: String,
}

/// Parameters for the `rebuild` action.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RebuildRequest {
    /// Image to rebuild from.
    pub image_ref: String,
    /// New display name, if changing.
    pub name: Option<String>,
    /// Replacement metadata, if changing.
    pub metadata: Option<BTreeMap<String, String>>,
    /// Files to inject.
    pub personality: Vec<PersonalityFile>,
    /// Explicit root password.
    pub admin_pass: Option<String>,
}

/// Body of `POST /servers/{id}/action`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerAction {
    /// Sets a new root password.
    ChangePassword {
        /// New password.
        admin_pass: String,
    },
    /// Restarts the server.
    Reboot(RebootKind),
    /// Reinstalls the server from an image.
    Rebuild(RebuildRequest),
    /// Moves the server to another flavor.
    Resize {
        /// Target flavor.
        flavor_ref: String,
    },
    /// Accepts a pending resize.
    ConfirmResize,
    /// Rolls back a pending resize.
    RevertResize,
    /// Snapshots the server into a new image.
    CreateImage {
        /// Name of the resulting image.
        name: String,
    },
}

impl ServerAction {
    /// Wire name of the action.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ChangePassword { .. } => "changePassword",
            Self::Reboot(_) => "reboot",
            Self::Rebuild(_) => "rebuild",
            Self::Resize { .. } => "resize",
            Self::ConfirmResize => "confirmResize",
            Self::RevertResize => "revertResize",
            Self::CreateImage { .. } => "createImage",
        }
    }

    /// Renders the JSON action body.
    #[must_use]
    pub fn to_body(&self) -> Value {
        let inner = match self {
            Self::ChangePassword { admin_pass } => json!({ "adminPass": admin_pass }),
            Self::Reboot(kind) => json!({ "type": kind.as_str() }),
            Self::Rebuild(request) => rebuild_body(request),
            Self::Resize { flavor_ref } => json!({ "flavorRef": flavor_ref }),
            Self::ConfirmResize | Self::RevertResize => Value::Null,
            Self::CreateImage { name } => json!({ "name": name }),
        };
        let mut body = Map::new();
        body.insert(self.name().to_owned(), inner);
        Value::Object(body)
    }
}

fn rebuild_body(request: &RebuildRequest) -> Value {
    let mut rebuild = Map::new();
    rebuild.insert(String::from("imageRef"), json!(request.image_ref));
    if let Some(name) = &request.name {
        rebuild.insert(String::from("name"), json!(name));
    }
    if let Some(metadata) = &request.metadata {
        rebuild.insert(String::from("metadata"), json!(metadata));
    }
    if !request.personality.is_empty() {
        let files: Vec<Value> = request
            .personality
            .iter()
            .map(|file| json!({ "path": file.path, "contents": STANDARD.encode(&file.contents) }))
            .collect();
        rebuild.insert(String::from("personality"), Value::Array(files));
    }
    if let Some(pass) = &request.admin_pass {
        rebuild.insert(String::from("adminPass"), json!(pass));
    }
    Value::Object(rebuild)
}

/// Body of `POST /images`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageRequest {
    /// Name of the resulting image.
    pub name: String,
    /// Server to snapshot, as an id or a full URL.
    pub server_ref: String,
}

impl ImageRequest {
    /// Renders the `{"image": {...}}` body.
    #[must_use]
    pub fn to_body(&self) -> Value {
        json!({ "image": { "name": self.name, "serverRef": self.server_ref } })
    }
}

/// Hyperlink attached to an entity.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Link {
    /// Relation, such as `self` or `bookmark`.
    #[serde(default)]
    pub rel: Option<String>,
    /// Target URL.
    pub href: String,
}

/// Reference to another entity by id and links.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct EntityRef {
    /// Referenced id.
    pub id: ResourceHandle,
    /// Links to the referenced entity.
    #[serde(default)]
    pub links: Vec<Link>,
}

impl EntityRef {
    /// Returns `true` when `reference` equals the id or the first link.
    #[must_use]
    pub fn matches(&self, reference: &str) -> bool {
        self.id.as_str() == reference
            || self
                .links
                .first()
                .is_some_and(|link| link.href == reference)
    }
}

/// Network address entry.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Address {
    /// IP address literal.
    pub addr: String,
    /// IP version when reported.
    #[serde(default)]
    pub version: Option<u8>,
}

/// Server as returned by the API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Server {
    /// Server id.
    pub id: ResourceHandle,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Lifecycle status.
    #[serde(default)]
    pub status: String,
    /// Addresses keyed by network label.
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<Address>>,
    /// Image the server runs.
    #[serde(default)]
    pub image: Option<EntityRef>,
    /// Flavor the server uses.
    #[serde(default)]
    pub flavor: Option<EntityRef>,
    /// User metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Root password, only present on create and rebuild responses.
    #[serde(default, rename = "adminPass")]
    pub admin_pass: Option<String>,
}

impl Server {
    /// Parses a `{"server": {...}}` envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::MalformedResponse`] when the envelope is
    /// missing or has the wrong shape.
    pub fn from_envelope(operation: &str, body: &Value) -> Result<Self, ComputeError> {
        from_member(operation, body, "server")
    }

    /// First address on the `public` network.
    #[must_use]
    pub fn public_address(&self) -> Option<&str> {
        self.addresses
            .get("public")
            .and_then(|entries| entries.first())
            .map(|entry| entry.addr.as_str())
    }

    /// Returns `true` when the server runs the referenced image.
    #[must_use]
    pub fn runs_image(&self, reference: &str) -> bool {
        self.image.as_ref().is_some_and(|image| image.matches(reference))
    }

    /// Flavor id, when reported.
    #[must_use]
    pub fn flavor_id(&self) -> Option<&str> {
        self.flavor.as_ref().map(|flavor| flavor.id.as_str())
    }
}

/// Image as returned by `GET /images/{id}`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Image {
    /// Image id.
    pub id: ResourceHandle,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Lifecycle status.
    #[serde(default)]
    pub status: String,
    /// Server the image was taken from, for snapshots.
    #[serde(default)]
    pub server: Option<EntityRef>,
    /// Links to the image itself.
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Image {
    /// Parses an `{"image": {...}}` envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::MalformedResponse`] on shape mismatch.
    pub fn from_envelope(operation: &str, body: &Value) -> Result<Self, ComputeError> {
        from_member(operation, body, "image")
    }

    /// First link of the source server, for snapshots.
    #[must_use]
    pub fn server_href(&self) -> Option<&str> {
        self.server
            .as_ref()
            .and_then(|server| server.links.first())
            .map(|link| link.href.as_str())
    }
}

/// Flavor as returned by `GET /flavors/{id}`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Flavor {
    /// Flavor id.
    pub id: ResourceHandle,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Memory in MiB.
    pub ram: u64,
    /// Root disk in GiB.
    pub disk: u64,
}

impl Flavor {
    /// Parses a `{"flavor": {...}}` envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::MalformedResponse`] on shape mismatch.
    pub fn from_envelope(operation: &str, body: &Value) -> Result<Self, ComputeError> {
        from_member(operation, body, "flavor")
    }
}

fn from_member<T>(operation: &str, body: &Value, member: &str) -> Result<T, ComputeError>
where
    T: for<'de> Deserialize<'de>,
{
    let value = body
        .get(member)
        .ok_or_else(|| ComputeError::MalformedResponse {
            operation: operation.to_owned(),
            message: format!("missing `{member}` member"),
        })?;
    T::deserialize(value).map_err(|err| ComputeError::MalformedResponse {
        operation: operation.to_owned(),
        message: err.to_string(),
    })
}
