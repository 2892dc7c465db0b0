//! # Error Handling
//!
//! This module defines the relay's error types and how the ones that happen
//! before the WebSocket upgrade are turned into HTTP responses.
//!
//! ## Error Categories:
//! - **Routing**: Bad path or missing meeting ID. The upgrade is refused, so
//!   no upstream work ever starts.
//! - **ConfigResolution**: The instruction store could not give us persona
//!   instructions for the meeting.
//! - **UpstreamConnect**: The voice backend refused or never finished the
//!   session handshake (auth, quota, network, timeout).
//! - **UpstreamDisconnect**: The backend dropped an established session.
//! - **ClientTransport**: The browser leg closed or failed.
//! - **Capacity**: Too many relays are already running.
//! - **Config**: Startup configuration problems.
//!
//! ## Key Rust Concepts:
//! - **enum**: Each variant is one failure origin, with the details it needs
//! - **Display trait**: Human-readable messages for logs
//! - **ResponseError trait**: Lets actix turn an error into an HTTP response
//!   automatically when a handler returns `Err(...)`
//!
//! ## Propagation policy:
//! Once a connection has been upgraded, every error is handled inside that
//! connection's relay actor and ends the same way: both legs are closed.
//! The browser only ever observes a transport close; no error payload is
//! written to the audio channel.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Why a connection request was refused by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The request carried no path at all.
    MissingPath,

    /// The path was not the single accepted route (`/`).
    UnknownRoute(String),

    /// The instructed variant requires `meeting_id` and it was absent or empty.
    MissingMeetingId,
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::MissingPath => write!(f, "no path provided"),
            RoutingError::UnknownRoute(path) => write!(f, "invalid pathname \"{}\"", path),
            RoutingError::MissingMeetingId => write!(f, "no meeting ID provided"),
        }
    }
}

/// Every way a relay connection can fail.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(RelayError::UpstreamConnect("401 invalid_api_key".to_string()));
/// ```
#[derive(Debug)]
pub enum RelayError {
    /// Malformed or missing routing information.
    Routing(RoutingError),

    /// Instruction store fetch or parse failure.
    ConfigResolution(String),

    /// Upstream session establishment failure.
    UpstreamConnect(String),

    /// Upstream session terminated while relaying.
    UpstreamDisconnect(String),

    /// Client leg closed or errored while relaying.
    ClientTransport(String),

    /// The concurrent relay limit has been reached.
    Capacity(usize),

    /// Configuration file or environment variable problems.
    Config(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Routing(err) => write!(f, "Routing error: {}", err),
            RelayError::ConfigResolution(msg) => write!(f, "Instruction resolution failed: {}", msg),
            RelayError::UpstreamConnect(msg) => write!(f, "Upstream connect failed: {}", msg),
            RelayError::UpstreamDisconnect(msg) => write!(f, "Upstream disconnected: {}", msg),
            RelayError::ClientTransport(msg) => write!(f, "Client transport error: {}", msg),
            RelayError::Capacity(max) => write!(f, "Maximum concurrent sessions ({}) reached", max),
            RelayError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    /// Machine-readable error type used in JSON bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Routing(RoutingError::UnknownRoute(_)) => "not_found",
            RelayError::Routing(_) => "bad_request",
            RelayError::ConfigResolution(_) => "config_resolution_error",
            RelayError::UpstreamConnect(_) => "upstream_connect_error",
            RelayError::UpstreamDisconnect(_) => "upstream_disconnect",
            RelayError::ClientTransport(_) => "client_transport_error",
            RelayError::Capacity(_) => "capacity_exceeded",
            RelayError::Config(_) => "config_error",
        }
    }
}

/// Converts listener rejections into HTTP responses.
///
/// Only routing and capacity errors normally reach this path, because they
/// are the only ones raised before the upgrade. The others map to gateway or
/// server errors for completeness.
///
/// ## HTTP Status Code Mapping:
/// - Routing (unknown route) → 404
/// - Routing (missing path / meeting ID) → 400
/// - Capacity → 503
/// - ConfigResolution / UpstreamConnect / UpstreamDisconnect → 502
/// - ClientTransport → 400
/// - Config → 500
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "Routing error: no meeting ID provided",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Routing(RoutingError::UnknownRoute(_)) => StatusCode::NOT_FOUND,
            RelayError::Routing(_) => StatusCode::BAD_REQUEST,
            RelayError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::ConfigResolution(_)
            | RelayError::UpstreamConnect(_)
            | RelayError::UpstreamDisconnect(_) => StatusCode::BAD_GATEWAY,
            RelayError::ClientTransport(_) => StatusCode::BAD_REQUEST,
            RelayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<RoutingError> for RelayError {
    fn from(err: RoutingError) -> Self {
        RelayError::Routing(err)
    }
}
