//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! The backend API key is deliberately *not* part of [`AppConfig`]. It is read
//! once from `OPENAI_API_KEY` into an [`ApiCredential`], which never prints its
//! value and is shared read-only by every upstream session.
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Arc<str>**: A cheaply clonable, immutable string shared between tasks
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_UPSTREAM__MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::upstream::{SessionConfig, TurnDetection};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Main relay configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section belongs to one collaborator: the listener (`server`), the
/// voice backend (`upstream`), the instruction store (`instructions`) and the
/// session limit (`performance`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub instructions: InstructionsConfig,
    pub performance: PerformanceConfig,
}

/// Listener settings.
///
/// ## Fields:
/// - `host` / `port`: Where the relay accepts browser connections
/// - `workers`: Number of single-threaded event loops (each relay lives on one)
/// - `heartbeat_interval_secs`: How often the browser is pinged
/// - `client_timeout_secs`: Silence after which a browser is considered gone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Voice backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Realtime WebSocket endpoint (without the model query parameter).
    pub url: String,

    /// Realtime model name, sent as `?model=`.
    pub model: String,

    /// Synthesized voice; empty means the backend default.
    pub voice: String,

    /// Persona instructions used when no instruction store is configured.
    pub default_instructions: String,

    /// Upper bound on the upstream handshake.
    pub connect_timeout_secs: u64,

    pub turn_detection: TurnDetectionConfig,
}

/// Turn detection settings as they appear in configuration.
///
/// ## Fields:
/// - `enabled`: When false, the backend's own defaults apply
/// - `mode`: Detection mode (`server_vad`)
/// - `interrupt_response`: Let the user talk over the assistant
/// - `threshold`: Voice activity threshold between 0.0 and 1.0
/// - `prefix_padding_ms` / `silence_duration_ms`: Turn boundaries in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    pub enabled: bool,
    pub mode: String,
    pub interrupt_response: bool,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// Instruction store settings.
///
/// When `enabled`, every connection must carry a `meeting_id` and its persona
/// instructions are fetched from `{base_url}/api/meetings/{id}/instructions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionsConfig {
    pub enabled: bool,
    pub base_url: String,
    pub request_timeout_secs: u64,
}

/// Capacity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of simultaneous browser ↔ backend relays.
    pub max_concurrent_sessions: usize,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the relay can start even if no configuration file
/// exists. They mirror the settings the browser client expects: 24kHz PCM,
/// port 3001, and server-side voice activity detection with interruptions.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3001,
                workers: 1,
                heartbeat_interval_secs: 15,
                client_timeout_secs: 45,
            },
            upstream: UpstreamConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o-realtime-preview".to_string(),
                voice: String::new(),
                default_instructions: "You are a helpful assistant.".to_string(),
                connect_timeout_secs: 15,
                turn_detection: TurnDetectionConfig {
                    enabled: true,
                    mode: "server_vad".to_string(),
                    interrupt_response: true,
                    threshold: 0.5,
                    prefix_padding_ms: 500,
                    silence_duration_ms: 500,
                },
            },
            instructions: InstructionsConfig {
                enabled: false,
                base_url: String::new(),
                request_timeout_secs: 10,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 64,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_UPSTREAM__MODEL=gpt-realtime`: Override the realtime model
    /// - `APP_INSTRUCTIONS__ENABLED=true`: Require a meeting ID per connection
    /// - `APP_INSTRUCTIONS__BASE_URL=https://store.example.com`: Instruction store
    /// - `PORT=3000`: Special case for deployment platforms
    ///
    /// Nested keys use a double underscore so that field names containing a
    /// single underscore (`base_url`, `connect_timeout_secs`) survive intact.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 and at least one worker is configured
    /// - The heartbeat fires more often than the client timeout
    /// - Upstream URL is set and the connect timeout is non-zero
    /// - Turn detection threshold lies in 0.0..=1.0
    /// - An enabled instruction store has a base URL that parses
    /// - At least one concurrent session is allowed
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.workers == 0 {
            return Err(anyhow::anyhow!("At least one worker is required"));
        }

        if self.server.heartbeat_interval_secs == 0
            || self.server.heartbeat_interval_secs >= self.server.client_timeout_secs
        {
            return Err(anyhow::anyhow!(
                "Heartbeat interval must be non-zero and shorter than the client timeout"
            ));
        }

        if self.upstream.url.trim().is_empty() {
            return Err(anyhow::anyhow!("Upstream URL must be set"));
        }

        if self.upstream.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Upstream connect timeout must be greater than 0"));
        }

        let threshold = self.upstream.turn_detection.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow::anyhow!(
                "Turn detection threshold must be between 0.0 and 1.0, got {}",
                threshold
            ));
        }

        if self.instructions.enabled {
            if self.instructions.base_url.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "Instruction store is enabled but instructions.base_url is empty"
                ));
            }
            reqwest::Url::parse(&self.instructions.base_url).map_err(|e| {
                anyhow::anyhow!("Invalid instructions.base_url {:?}: {}", self.instructions.base_url, e)
            })?;
            if self.instructions.request_timeout_secs == 0 {
                return Err(anyhow::anyhow!("Instruction request timeout must be greater than 0"));
            }
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Session configuration used before any per-meeting instructions are applied.
    pub fn session_defaults(&self) -> SessionConfig {
        let turn = &self.upstream.turn_detection;
        SessionConfig {
            instructions: self.upstream.default_instructions.clone(),
            voice: Some(self.upstream.voice.clone()).filter(|v| !v.is_empty()),
            turn_detection: turn.enabled.then(|| TurnDetection {
                mode: turn.mode.clone(),
                interrupt_response: turn.interrupt_response,
                threshold: turn.threshold,
                prefix_padding_ms: turn.prefix_padding_ms,
                silence_duration_ms: turn.silence_duration_ms,
            }),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.connect_timeout_secs)
    }
}

/// The backend API key, loaded once at startup.
///
/// ## Thread Safety:
/// `Arc<str>` makes clones cheap, and since the key never changes after
/// startup every upstream session can use it concurrently without locking.
///
/// ## Security:
/// `Debug` is implemented by hand so the key never ends up in logs.
#[derive(Clone)]
pub struct ApiCredential(Arc<str>);

impl ApiCredential {
    /// Environment variable holding the key.
    pub const ENV_VAR: &'static str = "OPENAI_API_KEY";

    pub fn new(key: impl Into<String>) -> Self {
        Self(Arc::from(key.into()))
    }

    /// Read the key from the environment. The relay refuses to start without it.
    pub fn from_env() -> Result<Self> {
        Self::from_value(env::var(Self::ENV_VAR).ok())
    }

    fn from_value(value: Option<String>) -> Result<Self> {
        match value {
            Some(key) if !key.trim().is_empty() => Ok(Self::new(key.trim())),
            _ => Err(anyhow::anyhow!(
                "Environment variable \"{}\" is required. Please set it in your .env file.",
                Self::ENV_VAR
            )),
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiCredential(***)")
    }
}
