//! # Upstream Voice Session
//!
//! The upstream side of a relay: one logical conversation with the voice-AI
//! backend per browser connection.
//!
//! ## Contract:
//! - **connect**: Establish the session with the process-wide credential and
//!   the per-connection [`SessionConfig`]. Must finish before audio flows.
//! - **send_audio**: Queue one frame for the backend. Never blocks and never
//!   reports failure directly; a broken transport shows up later as a
//!   `Disconnected` state event.
//! - **events**: An asynchronous stream of synthesized audio frames and
//!   connection-state changes. `Disconnected` is emitted at most once.
//! - **close**: Idempotent. Safe to call from the normal close path and the
//!   error path alike.
//!
//! ## Key Rust Concepts:
//! - **Trait objects** (`Box<dyn UpstreamSession>`): The relay does not care
//!   which backend sits behind the session, and tests swap in a recorder
//! - **BoxFuture**: Lets a trait method be async without extra crates
//! - **mpsc channels**: Events travel from the adapter's I/O tasks to the relay

pub mod openai;

use crate::audio::AudioFrame;
use crate::config::ApiCredential;
use crate::error::RelayError;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

pub use openai::RealtimeConnector;

/// Server-side turn detection settings forwarded to the backend.
///
/// The relay only configures these; deciding when the user stopped
/// speaking is the backend's job.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnDetection {
    /// Detection mode, e.g. `server_vad`.
    pub mode: String,

    /// Whether the user speaking interrupts an in-progress response.
    pub interrupt_response: bool,

    /// Voice activity energy threshold (0.0 to 1.0).
    pub threshold: f32,

    /// Audio kept before detected speech starts, in milliseconds.
    pub prefix_padding_ms: u32,

    /// Trailing silence that ends a turn, in milliseconds.
    pub silence_duration_ms: u32,
}

/// Behavioral configuration for one upstream session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Persona instructions for the assistant.
    pub instructions: String,

    /// Synthesized voice, or the backend default when `None`.
    pub voice: Option<String>,

    /// Turn detection settings, or the backend default when `None`.
    pub turn_detection: Option<TurnDetection>,
}

/// Connection state of an upstream session.
///
/// ## State Transitions:
/// Connecting → Connected → Disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Connecting,
    Connected,
    Disconnected,
}

/// Something the upstream session wants the relay to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Synthesized audio to play back in the browser.
    Audio(AudioFrame),

    /// The session moved to a new connection state.
    StateChanged(UpstreamState),
}

/// A live upstream session owned by exactly one relay.
pub trait UpstreamSession: Send {
    /// Queue one frame for the backend. Frames after `close()` are dropped.
    fn send_audio(&self, frame: AudioFrame);

    /// Terminate the session. Calling it more than once is a no-op.
    fn close(&self);
}

/// A connected session plus the stream of events it produces.
pub struct UpstreamLink {
    pub session: Box<dyn UpstreamSession>,
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

impl std::fmt::Debug for UpstreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamLink").finish_non_exhaustive()
    }
}

/// Factory for upstream sessions, shared by every relay in the process.
pub trait UpstreamConnector: Send + Sync {
    /// Open a new session. The returned future owns everything it needs, so
    /// the relay can run it on its own event loop.
    fn connect(
        &self,
        credential: ApiCredential,
        config: SessionConfig,
    ) -> BoxFuture<'static, Result<UpstreamLink, RelayError>>;
}
