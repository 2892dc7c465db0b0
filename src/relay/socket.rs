//! # Relay WebSocket Actor
//!
//! One `RelaySocket` actor owns one browser connection and the upstream
//! session created for it. Browser audio is forwarded upstream and upstream
//! audio is forwarded to the browser, both as raw binary frames.
//!
//! ## Connection Flow:
//! 1. **Started**: The listener already validated the route and took a session slot
//! 2. **Resolve**: Instructions are looked up (instructed variant) or taken from config
//! 3. **Connect**: The upstream session is opened, bounded by the connect timeout
//! 4. **Relay**: Frames flow both ways until either side ends
//! 5. **Teardown**: Both legs are closed in one step, exactly once
//!
//! ## Key Rust Concepts:
//! - **Actor model**: All state for a connection lives in one actor, and every
//!   event for it (client frames, upstream events, timers, setup results) runs
//!   on that actor's context. No locks are needed.
//! - **into_actor / map**: Async setup runs as an actor future, so its result is
//!   applied with `&mut self` access once it completes
//! - **Two StreamHandlers**: The browser stream and the upstream event stream
//!   are both just streams feeding the same actor
//!
//! ## Frames during setup:
//! Browser audio that arrives before the upstream is connected is dropped.
//!
//! ## Fragmented messages:
//! A binary message split into continuation frames is reassembled and
//! forwarded as one frame, up to [`MAX_FRAGMENTED_MESSAGE_BYTES`]. Fragmented
//! text is ignored like any other text message.

use crate::audio::AudioFrame;
use crate::error::RelayError;
use crate::relay::lifecycle::{RelayLifecycle, UpstreamAction};
use crate::relay::setup::{connect_upstream, resolve_session_config};
use crate::routing::RoutingParameters;
use crate::state::{AppState, SessionPermit};
use crate::upstream::{SessionConfig, UpstreamEvent};
use actix::prelude::*;
use actix_http::ws::Item as WsItem;
use actix_web_actors::ws;
use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest binary message accepted in continuation frames.
pub const MAX_FRAGMENTED_MESSAGE_BYTES: usize = 1024 * 1024;

/// A client message arriving in continuation frames.
struct Fragments {
    binary: bool,
    data: BytesMut,
}

pub struct RelaySocket {
    /// Identifies this connection in logs
    id: Uuid,

    lifecycle: RelayLifecycle,

    routing: RoutingParameters,

    state: AppState,

    /// Last time the browser showed any sign of life
    last_heartbeat: Instant,

    /// Message being reassembled from continuation frames
    fragments: Option<Fragments>,

    /// Occupied session slot, released when the actor is dropped
    _permit: SessionPermit,
}

impl RelaySocket {
    pub fn new(state: AppState, routing: RoutingParameters, permit: SessionPermit) -> Self {
        Self {
            id: Uuid::new_v4(),
            lifecycle: RelayLifecycle::new(),
            routing,
            state,
            last_heartbeat: Instant::now(),
            fragments: None,
            _permit: permit,
        }
    }

    /// Ping the browser periodically and drop it if it stops answering.
    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = Duration::from_secs(self.state.config.server.heartbeat_interval_secs);
        let timeout = Duration::from_secs(self.state.config.server.client_timeout_secs);

        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(connection_id = %act.id, "Client heartbeat timeout");
                act.teardown(ctx, "client heartbeat timeout");
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Resolve the session configuration, then connect upstream.
    fn establish(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.lifecycle.begin_resolving() {
            return;
        }

        let resolver = self.state.resolver.clone();
        let routing = self.routing.clone();
        let defaults = self.state.config.session_defaults();

        ctx.spawn(
            resolve_session_config(resolver, routing, defaults)
                .into_actor(self)
                .map(|result, act, ctx| match result {
                    Ok(config) => act.connect(config, ctx),
                    Err(err) => act.fail(err, ctx),
                }),
        );
    }

    fn connect(&mut self, config: SessionConfig, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.lifecycle.begin_connecting() {
            return;
        }
        debug!(connection_id = %self.id, "Connecting upstream");

        let connector = self.state.connector.clone();
        let credential = self.state.credential.clone();
        let timeout = self.state.config.connect_timeout();

        ctx.spawn(
            connect_upstream(connector, credential, config, timeout)
                .into_actor(self)
                .map(|result, act, ctx| match result {
                    Ok(link) => {
                        if act.lifecycle.attach_upstream(link.session) {
                            act.state.metrics.record_relay_established();
                            info!(connection_id = %act.id, "Relay established");
                            ctx.add_stream(UnboundedReceiverStream::new(link.events));
                        }
                    }
                    Err(err) => {
                        act.state.metrics.record_connect_failure();
                        act.fail(err, ctx);
                    }
                }),
        );
    }

    fn forward_client_audio(&mut self, data: Bytes) {
        let frame = AudioFrame::new(data);
        let bytes = frame.len();
        if self.lifecycle.forward_client_frame(frame) {
            self.state.metrics.record_frame_to_upstream(bytes);
        }
    }

    fn on_fragment(&mut self, item: WsItem, ctx: &mut ws::WebsocketContext<Self>) {
        let (chunk, last) = match item {
            WsItem::FirstBinary(data) => {
                self.fragments = Some(Fragments {
                    binary: true,
                    data: BytesMut::new(),
                });
                (data, false)
            }
            WsItem::FirstText(_) => {
                self.fragments = Some(Fragments {
                    binary: false,
                    data: BytesMut::new(),
                });
                return;
            }
            WsItem::Continue(data) => (data, false),
            WsItem::Last(data) => (data, true),
        };

        let Some(fragments) = self.fragments.as_mut() else {
            debug!(connection_id = %self.id, "Ignoring continuation without a first fragment");
            return;
        };

        if fragments.binary {
            if fragments.data.len() + chunk.len() > MAX_FRAGMENTED_MESSAGE_BYTES {
                self.fragments = None;
                self.fail(
                    RelayError::ClientTransport(format!(
                        "fragmented message exceeds {} bytes",
                        MAX_FRAGMENTED_MESSAGE_BYTES
                    )),
                    ctx,
                );
                return;
            }
            fragments.data.extend_from_slice(&chunk);
        }

        if last {
            match self.fragments.take() {
                Some(Fragments { binary: true, data }) => self.forward_client_audio(data.freeze()),
                _ => debug!(connection_id = %self.id, "Ignoring fragmented text message"),
            }
        }
    }

    /// Log why the relay is ending abnormally, then tear it down.
    fn fail(&mut self, err: RelayError, ctx: &mut ws::WebsocketContext<Self>) {
        warn!(
            connection_id = %self.id,
            state = self.lifecycle.state().as_str(),
            kind = err.kind(),
            error = %err,
            "Relay failed"
        );
        self.teardown(ctx, err.kind());
    }

    /// Close both legs. Safe to call from any path, any number of times.
    fn teardown(&mut self, ctx: &mut ws::WebsocketContext<Self>, reason: &str) {
        let from = self.lifecycle.state();
        if self.lifecycle.close() {
            info!(connection_id = %self.id, from = from.as_str(), reason, "Closing relay");
            ctx.close(None);
        }
        ctx.stop();
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!(
            connection_id = %self.id,
            meeting_id = self.routing.meeting_id.as_deref().unwrap_or("-"),
            "Relay started"
        );
        self.heartbeat(ctx);
        self.establish(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.lifecycle.close();
        debug!(connection_id = %self.id, "Relay stopped");
    }
}

/// Browser → relay.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Binary(data)) => self.forward_client_audio(data),
            Ok(ws::Message::Text(_)) => {
                debug!(connection_id = %self.id, "Ignoring text message");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(connection_id = %self.id, ?reason, "Client closed");
                self.teardown(ctx, "client closed");
            }
            Ok(ws::Message::Continuation(item)) => self.on_fragment(item, ctx),
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                self.fail(RelayError::ClientTransport(err.to_string()), ctx);
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        self.teardown(ctx, "client stream ended");
    }
}

/// Upstream → relay.
impl StreamHandler<UpstreamEvent> for RelaySocket {
    fn handle(&mut self, event: UpstreamEvent, ctx: &mut Self::Context) {
        match self.lifecycle.on_upstream_event(event) {
            UpstreamAction::Forward(frame) => {
                self.state.metrics.record_frame_to_client(frame.len());
                ctx.binary(frame.into_bytes());
            }
            UpstreamAction::Close => self.fail(
                RelayError::UpstreamDisconnect("backend closed the session".to_string()),
                ctx,
            ),
            UpstreamAction::Ignore => {}
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        self.teardown(ctx, "upstream event stream ended");
    }
}
