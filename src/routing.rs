//! # Connection Routing
//!
//! Decides whether an inbound request may become a relay. Every path except
//! `/health` lands here, because the listener has a single valid route (`/`)
//! and everything else must be answered with a proper rejection rather than
//! the framework's default 404 page.
//!
//! ## Acceptance Rules (checked in this order):
//! 1. The request has a path
//! 2. The path is exactly `/`
//! 3. When an instruction store is configured, `meeting_id` is present and non-empty
//! 4. A session slot is free
//! 5. The request is a valid WebSocket upgrade
//!
//! A rejected request is answered with a JSON error and never upgraded, so no
//! instruction lookup or upstream connect happens for it.
//!
//! ## Key Rust Concepts:
//! - **web::Payload**: The raw request body stream that `ws::start` takes over
//! - **ResponseError**: Returning `Err(RelayError)` is enough to produce the HTTP error
//! - **ServiceConfig**: Lets `main` and the tests mount the same routes

use crate::error::{RelayError, RoutingError};
use crate::health;
use crate::relay::RelaySocket;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::collections::HashMap;
use tracing::{info, warn};

/// The only path that accepts relay connections.
pub const RELAY_PATH: &str = "/";

/// Routing data extracted from an accepted request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingParameters {
    /// Meeting whose instructions should drive the session.
    pub meeting_id: Option<String>,
}

impl RoutingParameters {
    /// Validate the request target and pull out the routing data.
    ///
    /// `meeting_id` is kept even when not required; an empty value counts as absent.
    pub fn from_request(
        path: &str,
        query: &str,
        require_meeting_id: bool,
    ) -> Result<Self, RoutingError> {
        if path.is_empty() {
            return Err(RoutingError::MissingPath);
        }

        if path != RELAY_PATH {
            return Err(RoutingError::UnknownRoute(path.to_string()));
        }

        let meeting_id = web::Query::<HashMap<String, String>>::from_query(query)
            .ok()
            .and_then(|params| params.into_inner().remove("meeting_id"))
            .filter(|id| !id.is_empty());

        if require_meeting_id && meeting_id.is_none() {
            return Err(RoutingError::MissingMeetingId);
        }

        Ok(Self { meeting_id })
    }
}

/// Accept or reject a connection request, then hand accepted ones to a relay actor.
pub async fn relay_endpoint(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let peer = req
        .connection_info()
        .peer_addr()
        .unwrap_or("unknown")
        .to_string();

    let routing = match RoutingParameters::from_request(
        req.path(),
        req.query_string(),
        state.requires_meeting_id(),
    ) {
        Ok(routing) => routing,
        Err(err) => {
            state.metrics.record_rejected();
            warn!(peer = %peer, path = %req.path(), reason = %err, "Rejected connection");
            return Err(RelayError::Routing(err).into());
        }
    };

    let max_sessions = state.config.performance.max_concurrent_sessions;
    let permit = match state.metrics.try_acquire_session(max_sessions) {
        Some(permit) => permit,
        None => {
            state.metrics.record_rejected();
            warn!(peer = %peer, max_sessions, "Rejected connection: at capacity");
            return Err(RelayError::Capacity(max_sessions).into());
        }
    };

    let socket = RelaySocket::new(state.get_ref().clone(), routing.clone(), permit);
    let response = match ws::start(socket, &req, stream) {
        Ok(response) => response,
        Err(err) => {
            // Not a valid upgrade; the permit is released with the unstarted actor.
            state.metrics.record_rejected();
            warn!(peer = %peer, reason = %err, "Rejected connection: handshake failed");
            return Err(err);
        }
    };

    state.metrics.record_accepted();
    info!(
        peer = %peer,
        meeting_id = routing.meeting_id.as_deref().unwrap_or("-"),
        "Accepted connection"
    );

    Ok(response)
}

/// Mount the health probe and the catch-all relay endpoint.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .default_service(web::to(relay_endpoint));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_state, MockUpstream};
    use actix_web::http::StatusCode;
    use actix_web::{test as actix_test, App};

    #[test]
    fn test_root_path_is_accepted() {
        let routing = RoutingParameters::from_request("/", "", false).unwrap();
        assert_eq!(routing, RoutingParameters::default());
    }

    #[test]
    fn test_other_paths_are_rejected() {
        assert_eq!(
            RoutingParameters::from_request("/other", "", false),
            Err(RoutingError::UnknownRoute("/other".to_string()))
        );
        assert_eq!(
            RoutingParameters::from_request("", "", false),
            Err(RoutingError::MissingPath)
        );
    }

    #[test]
    fn test_meeting_id_rules() {
        let routing = RoutingParameters::from_request("/", "meeting_id=m-7&x=1", true).unwrap();
        assert_eq!(routing.meeting_id.as_deref(), Some("m-7"));

        assert_eq!(
            RoutingParameters::from_request("/", "", true),
            Err(RoutingError::MissingMeetingId)
        );
        assert_eq!(
            RoutingParameters::from_request("/", "meeting_id=", true),
            Err(RoutingError::MissingMeetingId)
        );

        // Ignored but kept when no instruction store is configured.
        let routing = RoutingParameters::from_request("/", "meeting_id=m-7", false).unwrap();
        assert_eq!(routing.meeting_id.as_deref(), Some("m-7"));
    }

    #[actix_web::test]
    async fn test_rejections_are_json_errors() {
        let upstream = MockUpstream::new();
        let state = test_state(upstream.connector(), None);
        let metrics = state.metrics.clone();
        let app = actix_test::init_service(App::new().app_data(web::Data::new(state)).configure(configure)).await;

        let req = actix_test::TestRequest::get().uri("/other").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "not_found");

        assert_eq!(metrics.snapshot().rejected_connections, 1);
        assert_eq!(metrics.snapshot().active_sessions, 0);
        assert_eq!(upstream.connect_calls(), 0);
    }

    #[test]
    fn test_meeting_id_is_percent_decoded() {
        let routing = RoutingParameters::from_request("/", "meeting_id=team%20sync", true).unwrap();
        assert_eq!(routing.meeting_id.as_deref(), Some("team sync"));
    }

    #[actix_web::test]
    async fn test_plain_get_without_upgrade_is_counted_as_rejected() {
        let upstream = MockUpstream::new();
        let state = test_state(upstream.connector(), None);
        let metrics = state.metrics.clone();
        let app = actix_test::init_service(App::new().app_data(web::Data::new(state)).configure(configure)).await;

        let req = actix_test::TestRequest::get().uri("/").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rejected_connections, 1);
        assert_eq!(snapshot.accepted_connections, 0);
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(upstream.connect_calls(), 0);
    }
}
