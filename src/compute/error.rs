//! Errors raised by compute API clients.

use thiserror::Error;

/// Failures talking to the compute API or interpreting its responses.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ComputeError {
    /// The request never produced an HTTP response.
    #[error("{method} {path} failed: {message}")]
    Transport {
        /// HTTP method.
        method: String,
        /// Path relative to the API root.
        path: String,
        /// Client error text.
        message: String,
    },
    /// The API answered with a status the operation does not accept.
    #[error("{operation} returned HTTP {status}: {body}")]
    UnexpectedStatus {
        /// Logical operation, for example `get server 42`.
        operation: String,
        /// HTTP status code received.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },
    /// The body did not have the expected shape.
    #[error("{operation} returned a malformed body: {message}")]
    MalformedResponse {
        /// Logical operation.
        operation: String,
        /// Decoder error text.
        message: String,
    },
    /// The configured endpoint could not form a valid URL.
    #[error("invalid compute endpoint: {0}")]
    InvalidEndpoint(String),
    /// A request builder was missing a required field.
    #[error("missing or empty field: {0}")]
    InvalidRequest(String),
}

impl ComputeError {
    /// Returns `true` when the API reported the resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::UnexpectedStatus { status: 404, .. })
    }
}
