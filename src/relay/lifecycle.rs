//! # Relay Lifecycle
//!
//! The per-connection state machine, kept free of any actor or socket so the
//! rules can be tested directly.
//!
//! ## State Transitions:
//! ```text
//! Accepted → ResolvingConfig → ConnectingUpstream → Relaying → Closing → Closed
//!               │                    │
//!               └──── failure ───────┴──────────────────────→ Closing
//! ```
//!
//! ## Invariants:
//! - Audio moves in either direction only while `Relaying`
//! - The upstream session is closed exactly once, whichever side ends first
//! - A session that arrives after the client already left is closed immediately

use crate::audio::AudioFrame;
use crate::upstream::{UpstreamEvent, UpstreamSession, UpstreamState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    ResolvingConfig,
    ConnectingUpstream,
    Relaying,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::ResolvingConfig => "resolving_config",
            ConnectionState::ConnectingUpstream => "connecting_upstream",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// What the relay should do with an upstream event.
#[derive(Debug, PartialEq)]
pub enum UpstreamAction {
    /// Send the frame to the browser as one binary message.
    Forward(AudioFrame),

    /// The upstream is gone; tear the connection down.
    Close,

    /// Nothing to do.
    Ignore,
}

/// One connection's position in its lifecycle plus the upstream it owns.
pub struct RelayLifecycle {
    state: ConnectionState,
    upstream: Option<Box<dyn UpstreamSession>>,
}

impl Default for RelayLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayLifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Accepted,
            upstream: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_relaying(&self) -> bool {
        self.state == ConnectionState::Relaying
    }

    /// Accepted → ResolvingConfig.
    pub fn begin_resolving(&mut self) -> bool {
        self.advance(ConnectionState::Accepted, ConnectionState::ResolvingConfig)
    }

    /// ResolvingConfig → ConnectingUpstream.
    pub fn begin_connecting(&mut self) -> bool {
        self.advance(ConnectionState::ResolvingConfig, ConnectionState::ConnectingUpstream)
    }

    /// ConnectingUpstream → Relaying, taking ownership of the session.
    ///
    /// Returns `false` if the connection is no longer waiting for an upstream
    /// (the client left mid-connect); the session is closed on the spot.
    pub fn attach_upstream(&mut self, session: Box<dyn UpstreamSession>) -> bool {
        if self.state != ConnectionState::ConnectingUpstream {
            session.close();
            return false;
        }
        self.upstream = Some(session);
        self.state = ConnectionState::Relaying;
        true
    }

    /// Hand one client frame to the upstream. Empty frames and frames outside
    /// `Relaying` are dropped.
    pub fn forward_client_frame(&self, frame: AudioFrame) -> bool {
        if !self.is_relaying() || frame.is_empty() {
            return false;
        }
        match &self.upstream {
            Some(session) => {
                session.send_audio(frame);
                true
            }
            None => false,
        }
    }

    pub fn on_upstream_event(&self, event: UpstreamEvent) -> UpstreamAction {
        match event {
            UpstreamEvent::Audio(frame) if self.is_relaying() && !frame.is_empty() => {
                UpstreamAction::Forward(frame)
            }
            UpstreamEvent::Audio(_) => UpstreamAction::Ignore,
            UpstreamEvent::StateChanged(UpstreamState::Disconnected) if !self.state.is_terminal() => {
                UpstreamAction::Close
            }
            UpstreamEvent::StateChanged(_) => UpstreamAction::Ignore,
        }
    }

    /// Close both legs' state in one step. Returns `true` only for the call
    /// that actually performed the teardown.
    pub fn close(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ConnectionState::Closing;
        if let Some(session) = self.upstream.take() {
            session.close();
        }
        self.state = ConnectionState::Closed;
        true
    }

    fn advance(&mut self, from: ConnectionState, to: ConnectionState) -> bool {
        if self.state != from {
            return false;
        }
        self.state = to;
        true
    }
}

impl Drop for RelayLifecycle {
    fn drop(&mut self) {
        self.close();
    }
}
