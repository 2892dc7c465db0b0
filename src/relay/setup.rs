//! Session setup steps that run before relaying begins.

use crate::config::ApiCredential;
use crate::error::RelayError;
use crate::instructions::InstructionResolver;
use crate::routing::RoutingParameters;
use crate::upstream::{SessionConfig, UpstreamConnector, UpstreamLink};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Produce the configuration for one upstream session.
///
/// Without a resolver the defaults are used as-is. With one, the meeting's
/// instructions replace the default instructions; voice and turn detection
/// still come from configuration.
pub async fn resolve_session_config(
    resolver: Option<Arc<dyn InstructionResolver>>,
    routing: RoutingParameters,
    defaults: SessionConfig,
) -> Result<SessionConfig, RelayError> {
    let Some(resolver) = resolver else {
        return Ok(defaults);
    };

    let meeting_id = routing.meeting_id.ok_or_else(|| {
        RelayError::ConfigResolution("no meeting ID to resolve instructions for".to_string())
    })?;

    let resolved = resolver.resolve(&meeting_id).await?;
    debug!(meeting_id = %meeting_id, chars = resolved.instructions.len(), "Resolved instructions");

    Ok(SessionConfig {
        instructions: resolved.instructions,
        ..defaults
    })
}

/// Open the upstream session, giving up after `timeout`.
pub async fn connect_upstream(
    connector: Arc<dyn UpstreamConnector>,
    credential: ApiCredential,
    config: SessionConfig,
    timeout: Duration,
) -> Result<UpstreamLink, RelayError> {
    match tokio::time::timeout(timeout, connector.connect(credential, config)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::UpstreamConnect(format!("timed out after {:?}", timeout))),
    }
}
