//! Compute API abstraction and the helpers scenarios build on.
//!
//! [`ComputeApi::send`] is the single required method; everything else is a
//! provided helper that shapes a request and interprets the response. Status
//! accessors for [`crate::wait::StatusWaiter`] are exposed through the
//! [`ServerStatus`] and [`ImageStatus`] adapters.

use std::future::Future;
use std::pin::Pin;

use reqwest::Method;
use serde_json::Value;

use crate::handle::ResourceHandle;
use crate::wait::{StatusFuture, StatusSource};

mod client;
mod error;
mod types;

pub use client::NovaClient;
pub use error::ComputeError;
pub use types::{
    Address, EntityRef, Flavor, Image, ImageRequest, Link, PersonalityFile, RebootKind,
    RebuildRequest, Server, ServerAction, ServerRequest, ServerRequestBuilder,
};

/// Future returned by compute API operations.
pub type ComputeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ComputeError>> + Send + 'a>>;

/// HTTP request relative to the API root.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path beginning with `/`, relative to the versioned API root.
    pub path: String,
    /// JSON body, if any.
    pub body: Option<Value>,
}

impl ApiRequest {
    /// `GET path`.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    /// `POST path` with a JSON body.
    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }

    /// `DELETE path`.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::DELETE,
            path: path.into(),
            body: None,
        }
    }
}

/// HTTP response with the body decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Location` header, when present.
    pub location: Option<String>,
    /// Decoded JSON body. Empty bodies decode to `Value::Null`; bodies that
    /// are not JSON are kept as `Value::String`.
    pub body: Value,
}

impl ApiResponse {
    /// Fails unless the status is one of `accepted`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::UnexpectedStatus`] carrying the body.
    pub fn expect_status(&self, operation: &str, accepted: &[u16]) -> Result<(), ComputeError> {
        if accepted.contains(&self.status) {
            return Ok(());
        }
        Err(ComputeError::UnexpectedStatus {
            operation: operation.to_owned(),
            status: self.status,
            body: self.body.to_string(),
        })
    }

    /// Last path segment of the `Location` header.
    #[must_use]
    pub fn location_id(&self) -> Option<ResourceHandle> {
        let location = self.location.as_deref()?.trim_end_matches('/');
        let (_, id) = location.rsplit_once('/')?;
        (!id.is_empty()).then(|| ResourceHandle::from(id))
    }
}

/// Compute API client.
pub trait ComputeApi: Send + Sync {
    /// Sends one request and returns the response, whatever its status.
    fn send(&self, request: ApiRequest) -> ComputeFuture<'_, ApiResponse>;

    /// Creates a server and returns the create response view (which carries
    /// the generated `adminPass`).
    fn create_server<'a>(&'a self, request: &'a ServerRequest) -> ComputeFuture<'a, Server> {
        Box::pin(async move {
            let response = self
                .send(ApiRequest::post("/servers", request.to_body()))
                .await?;
            response.expect_status("create server", &[200, 202])?;
            Server::from_envelope("create server", &response.body)
        })
    }

    /// Fetches a server.
    fn get_server<'a>(&'a self, id: &'a ResourceHandle) -> ComputeFuture<'a, Server> {
        Box::pin(async move {
            let operation = format!("get server {id}");
            let response = self.send(ApiRequest::get(format!("/servers/{id}"))).await?;
            response.expect_status(&operation, &[200, 203])?;
            Server::from_envelope(&operation, &response.body)
        })
    }

    /// Fetches only the status of a server.
    fn server_status<'a>(&'a self, id: &'a ResourceHandle) -> ComputeFuture<'a, String> {
        Box::pin(async move { Ok(self.get_server(id).await?.status) })
    }

    /// Posts an action and returns the raw response so callers can assert on
    /// its status code.
    fn server_action<'a>(
        &'a self,
        id: &'a ResourceHandle,
        action: &'a ServerAction,
    ) -> ComputeFuture<'a, ApiResponse> {
        self.send(ApiRequest::post(
            format!("/servers/{id}/action"),
            action.to_body(),
        ))
    }

    /// Deletes a server.
    fn delete_server<'a>(&'a self, id: &'a ResourceHandle) -> ComputeFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .send(ApiRequest::delete(format!("/servers/{id}")))
                .await?;
            response.expect_status(&format!("delete server {id}"), &[200, 202, 204])
        })
    }

    /// Fetches an image.
    fn get_image<'a>(&'a self, id: &'a ResourceHandle) -> ComputeFuture<'a, Image> {
        Box::pin(async move {
            let operation = format!("get image {id}");
            let response = self.send(ApiRequest::get(format!("/images/{id}"))).await?;
            response.expect_status(&operation, &[200, 203])?;
            Image::from_envelope(&operation, &response.body)
        })
    }

    /// Fetches only the status of an image.
    fn image_status<'a>(&'a self, id: &'a ResourceHandle) -> ComputeFuture<'a, String> {
        Box::pin(async move { Ok(self.get_image(id).await?.status) })
    }

    /// Deletes an image.
    fn delete_image<'a>(&'a self, id: &'a ResourceHandle) -> ComputeFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .send(ApiRequest::delete(format!("/images/{id}")))
                .await?;
            response.expect_status(&format!("delete image {id}"), &[200, 202, 204])
        })
    }
}

/// [`StatusSource`] reading server status.
#[derive(Debug)]
pub struct ServerStatus<'c, A: ?Sized>(pub &'c A);

impl<A: ComputeApi + ?Sized> StatusSource for ServerStatus<'_, A> {
    type Error = ComputeError;

    fn status<'a>(&'a self, handle: &'a ResourceHandle) -> StatusFuture<'a, ComputeError> {
        self.0.server_status(handle)
    }
}

/// [`StatusSource`] reading image status.
#[derive(Debug)]
pub struct ImageStatus<'c, A: ?Sized>(pub &'c A);

impl<A: ComputeApi + ?Sized> StatusSource for ImageStatus<'_, A> {
    type Error = ComputeError;

    fn status<'a>(&'a self, handle: &'a ResourceHandle) -> StatusFuture<'a, ComputeError> {
        self.0.image_status(handle)
    }
}

#[cfg(test)]
mod tests;
