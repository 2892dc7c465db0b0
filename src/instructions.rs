//! # Instruction Resolver
//!
//! Fetches per-meeting persona instructions from an external store before
//! the upstream session is created.
//!
//! ## Store Protocol:
//! - **Request**: `GET {base_url}/api/meetings/{meeting_id}/instructions`
//! - **Response**: JSON with an `instructions` string field
//!
//! ## Failure Policy:
//! A transport failure, a non-2xx status, a body that is not JSON, or a
//! missing/blank `instructions` field all fail the connection attempt. There
//! is no retry: the browser reconnects to try again. Because this runs before
//! the upstream connect, a failure never leaves an upstream session behind.

use crate::config::InstructionsConfig;
use crate::error::RelayError;
use futures_util::future::BoxFuture;
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Configuration resolved for one meeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInstructions {
    pub instructions: String,
}

/// Looks up the instructions for a meeting.
pub trait InstructionResolver: Send + Sync {
    fn resolve(&self, meeting_id: &str) -> BoxFuture<'static, Result<SessionInstructions, RelayError>>;
}

#[derive(Debug, Deserialize)]
struct InstructionsPayload {
    #[serde(default)]
    instructions: Option<String>,
}

impl InstructionsPayload {
    fn into_instructions(self) -> Option<SessionInstructions> {
        self.instructions
            .filter(|text| !text.trim().is_empty())
            .map(|instructions| SessionInstructions { instructions })
    }
}

/// Resolver backed by the meetings HTTP API.
#[derive(Debug, Clone)]
pub struct HttpInstructionResolver {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpInstructionResolver {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow::anyhow!("Instruction store URL {} cannot carry a path", base_url));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &InstructionsConfig) -> anyhow::Result<Self> {
        Self::new(&config.base_url, Duration::from_secs(config.request_timeout_secs))
    }

    /// Build the per-meeting URL. The meeting ID is encoded as a single path segment.
    fn instructions_url(&self, meeting_id: &str) -> Result<Url, RelayError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                RelayError::ConfigResolution("instruction store URL cannot carry a path".to_string())
            })?;
            segments
                .pop_if_empty()
                .extend(["api", "meetings", meeting_id, "instructions"]);
        }
        Ok(url)
    }
}

impl InstructionResolver for HttpInstructionResolver {
    fn resolve(&self, meeting_id: &str) -> BoxFuture<'static, Result<SessionInstructions, RelayError>> {
        let url = self.instructions_url(meeting_id);
        let client = self.client.clone();

        Box::pin(async move {
            let url = url?;
            debug!(url = %url, "Fetching meeting instructions");

            let response = client
                .get(url)
                .send()
                .await
                .map_err(|e| RelayError::ConfigResolution(format!("fetch failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(RelayError::ConfigResolution(format!(
                    "instruction store returned {}",
                    status
                )));
            }

            let payload: InstructionsPayload = response
                .json()
                .await
                .map_err(|e| RelayError::ConfigResolution(format!("invalid response body: {}", e)))?;

            payload
                .into_instructions()
                .ok_or_else(|| RelayError::ConfigResolution("no instructions provided".to_string()))
        })
    }
}
