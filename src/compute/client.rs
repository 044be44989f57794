//! [`ComputeApi`] over HTTP using `reqwest`.

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use serde_json::Value;
use tracing::debug;

use super::{ApiRequest, ApiResponse, ComputeApi, ComputeError, ComputeFuture};
use crate::config::ComputeConfig;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const JSON: &str = "application/json";

/// HTTP client for a nova-style compute endpoint.
#[derive(Clone, Debug)]
pub struct NovaClient {
    http: reqwest::Client,
    api_root: String,
    token: String,
}

impl NovaClient {
    /// Builds a client for the endpoint described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::InvalidEndpoint`] when the HTTP client cannot
    /// be constructed or the endpoint does not parse as a URL.
    pub fn new(config: &ComputeConfig) -> Result<Self, ComputeError> {
        let api_root = config.api_root();
        reqwest::Url::parse(&api_root)
            .map_err(|err| ComputeError::InvalidEndpoint(format!("{api_root}: {err}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|err| ComputeError::InvalidEndpoint(err.to_string()))?;
        Ok(Self {
            http,
            api_root,
            token: config.auth_token.clone(),
        })
    }

    /// Versioned API root, without a trailing slash.
    #[must_use]
    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    pub(crate) fn build_request(&self, request: &ApiRequest) -> Result<reqwest::Request, ComputeError> {
        let url = format!("{}{}", self.api_root, request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .header(AUTH_TOKEN_HEADER, &self.token)
            .header(ACCEPT, JSON);
        if let Some(body) = &request.body {
            builder = builder.header(CONTENT_TYPE, JSON).body(body.to_string());
        }
        builder.build().map_err(|err| transport_error(request, &err))
    }
}

impl ComputeApi for NovaClient {
    fn send(&self, request: ApiRequest) -> ComputeFuture<'_, ApiResponse> {
        Box::pin(async move {
            let http_request = self.build_request(&request)?;
            debug!(method = %request.method, path = %request.path, "compute request");

            let response = self
                .http
                .execute(http_request)
                .await
                .map_err(|err| transport_error(&request, &err))?;
            let status = response.status().as_u16();
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let text = response
                .text()
                .await
                .map_err(|err| transport_error(&request, &err))?;

            debug!(method = %request.method, path = %request.path, status, "compute response");
            Ok(ApiResponse {
                status,
                location,
                body: decode_body(&text),
            })
        })
    }
}

fn decode_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}

fn transport_error(request: &ApiRequest, err: &reqwest::Error) -> ComputeError {
    ComputeError::Transport {
        method: request.method.to_string(),
        path: request.path.clone(),
        message: err.to_string(),
    }
}
