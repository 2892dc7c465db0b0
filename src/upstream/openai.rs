//! # OpenAI Realtime Session Adapter
//!
//! Speaks the OpenAI Realtime WebSocket protocol on behalf of one relay.
//!
//! ## Protocol:
//! 1. **Handshake**: `GET {url}?model={model}` with `Authorization: Bearer <key>`
//!    and `OpenAI-Beta: realtime=v1`
//! 2. **Configuration**: A `session.update` event carrying the persona
//!    instructions, PCM16 audio formats and turn detection settings
//! 3. **Upstream audio**: Each frame becomes one `input_audio_buffer.append`
//!    event with the PCM bytes base64-encoded
//! 4. **Downstream audio**: Each `response.audio.delta` event is decoded back
//!    into one PCM frame
//!
//! ## Task Layout:
//! After the handshake the socket is split. A writer task drains the
//! session's outbound queue, a reader task turns server events into
//! [`UpstreamEvent`]s. Either task noticing a dead socket marks the session
//! disconnected, which emits exactly one `Disconnected` event.
//!
//! After a local `close()` the reader waits at most [`CLOSE_GRACE`] for the
//! server's close reply, then gives up on the socket.

use crate::audio::AudioFrame;
use crate::config::{ApiCredential, UpstreamConfig};
use crate::error::RelayError;
use crate::upstream::{
    SessionConfig, TurnDetection, UpstreamConnector, UpstreamEvent, UpstreamLink, UpstreamSession,
    UpstreamState,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type RealtimeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a locally closed session waits for the server to finish the close handshake.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Events we send to the realtime API.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
}

#[derive(Debug, Serialize)]
struct SessionUpdate {
    modalities: Vec<&'static str>,
    instructions: String,
    input_audio_format: &'static str,
    output_audio_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn_detection: Option<TurnDetectionPayload>,
}

#[derive(Debug, Serialize)]
struct TurnDetectionPayload {
    #[serde(rename = "type")]
    kind: String,
    threshold: f32,
    prefix_padding_ms: u32,
    silence_duration_ms: u32,
    interrupt_response: bool,
    create_response: bool,
}

impl From<&TurnDetection> for TurnDetectionPayload {
    fn from(turn: &TurnDetection) -> Self {
        Self {
            kind: turn.mode.clone(),
            threshold: turn.threshold,
            prefix_padding_ms: turn.prefix_padding_ms,
            silence_duration_ms: turn.silence_duration_ms,
            interrupt_response: turn.interrupt_response,
            create_response: true,
        }
    }
}

impl SessionUpdate {
    fn from_config(config: &SessionConfig) -> Self {
        Self {
            modalities: vec!["audio", "text"],
            instructions: config.instructions.clone(),
            input_audio_format: "pcm16",
            output_audio_format: "pcm16",
            voice: config.voice.clone(),
            turn_detection: config.turn_detection.as_ref().map(TurnDetectionPayload::from),
        }
    }
}

/// Events the realtime API sends us. Anything not listed is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "error")]
    Error { error: ServerError },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

/// Opens realtime sessions against one endpoint and model.
#[derive(Debug, Clone)]
pub struct RealtimeConnector {
    url: String,
    model: String,
}

impl RealtimeConnector {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.url.clone(), config.model.clone())
    }

    /// Full handshake URL including the model query parameter.
    ///
    /// A base URL without a path gets `/`, and the model is percent-encoded.
    fn endpoint(&self) -> Result<Url, RelayError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| RelayError::UpstreamConnect(format!("invalid realtime URL {}: {}", self.url, e)))?;
        if url.path().is_empty() {
            url.set_path("/");
        }
        if !self.model.is_empty() {
            url.query_pairs_mut().append_pair("model", &self.model);
        }
        Ok(url)
    }
}

impl UpstreamConnector for RealtimeConnector {
    fn connect(
        &self,
        credential: ApiCredential,
        config: SessionConfig,
    ) -> BoxFuture<'static, Result<UpstreamLink, RelayError>> {
        let endpoint = self.endpoint();
        Box::pin(async move { open_session(endpoint?, credential, config).await })
    }
}

/// State shared between the session handle and its I/O tasks.
struct SessionShared {
    closed: AtomicBool,
    disconnected: AtomicBool,
    close_requested: Notify,
    events: mpsc::UnboundedSender<UpstreamEvent>,
}

impl SessionShared {
    fn emit(&self, event: UpstreamEvent) {
        // The receiver is gone once the relay has torn down; nothing to do then.
        let _ = self.events.send(event);
    }

    fn mark_disconnected(&self) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            self.emit(UpstreamEvent::StateChanged(UpstreamState::Disconnected));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

enum Outbound {
    Audio(AudioFrame),
    Close,
}

/// Handle to one realtime conversation.
pub struct RealtimeSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<SessionShared>,
}

impl UpstreamSession for RealtimeSession {
    fn send_audio(&self, frame: AudioFrame) {
        if self.shared.is_closed() || self.shared.disconnected.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(Outbound::Audio(frame));
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing realtime session");
        let _ = self.outbound.send(Outbound::Close);
        self.shared.close_requested.notify_one();
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn open_session(
    endpoint: Url,
    credential: ApiCredential,
    config: SessionConfig,
) -> Result<UpstreamLink, RelayError> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let _ = events_tx.send(UpstreamEvent::StateChanged(UpstreamState::Connecting));

    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::UpstreamConnect(format!("invalid realtime URL: {}", e)))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
        .map_err(|_| RelayError::UpstreamConnect("credential is not a valid header value".to_string()))?;
    request.headers_mut().insert("Authorization", bearer);
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    info!("Connecting to realtime API...");
    let (socket, response) = connect_async(request).await.map_err(describe_connect_error)?;
    debug!(status = %response.status(), "Realtime socket opened");

    let (mut sink, stream) = socket.split();

    let update = ClientEvent::SessionUpdate {
        session: SessionUpdate::from_config(&config),
    };
    let payload = serde_json::to_string(&update)
        .map_err(|e| RelayError::UpstreamConnect(format!("could not encode session.update: {}", e)))?;
    sink.send(Message::Text(payload))
        .await
        .map_err(|e| RelayError::UpstreamConnect(format!("session.update failed: {}", e)))?;

    let shared = Arc::new(SessionShared {
        closed: AtomicBool::new(false),
        disconnected: AtomicBool::new(false),
        close_requested: Notify::new(),
        events: events_tx,
    });
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(sink, outbound_rx, shared.clone()));
    tokio::spawn(read_loop(stream, shared.clone()));

    shared.emit(UpstreamEvent::StateChanged(UpstreamState::Connected));
    info!(
        turn_detection = config.turn_detection.is_some(),
        "Connected to realtime API"
    );

    Ok(UpstreamLink {
        session: Box::new(RealtimeSession {
            outbound: outbound_tx,
            shared,
        }),
        events: events_rx,
    })
}

fn describe_connect_error(err: tungstenite::Error) -> RelayError {
    match err {
        tungstenite::Error::Http(response) => {
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            RelayError::UpstreamConnect(format!("HTTP {} {}", response.status(), body).trim().to_string())
        }
        other => RelayError::UpstreamConnect(other.to_string()),
    }
}

async fn write_loop(
    mut sink: SplitSink<RealtimeSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<SessionShared>,
) {
    while let Some(command) = outbound.recv().await {
        match command {
            Outbound::Audio(frame) => {
                trace!(bytes = frame.len(), duration_ms = frame.duration_ms(), "Appending input audio");
                let event = ClientEvent::InputAudioBufferAppend {
                    audio: BASE64.encode(frame.as_bytes()),
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "Could not encode audio append");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(payload)).await {
                    warn!(error = %err, "Realtime write failed");
                    shared.mark_disconnected();
                    return;
                }
            }
            Outbound::Close => break,
        }
    }

    // Either close() was called or the session handle was dropped.
    let shutdown = async {
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    };
    if tokio::time::timeout(CLOSE_GRACE, shutdown).await.is_err() {
        debug!("Realtime close frame not flushed in time");
    }
}

async fn read_loop(mut stream: SplitStream<RealtimeSocket>, shared: Arc<SessionShared>) {
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = shared.close_requested.notified() => {
                await_close_reply(&mut stream).await;
                break;
            }
        };

        match message {
            Some(Ok(Message::Text(text))) => handle_server_event(&text, &shared),
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Realtime socket closed by server");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                if !shared.is_closed() {
                    warn!(error = %err, "Realtime read failed");
                }
                break;
            }
            None => break,
        }
    }

    shared.mark_disconnected();
}

/// Drain the socket until the server answers our close, for at most [`CLOSE_GRACE`].
async fn await_close_reply(stream: &mut SplitStream<RealtimeSocket>) {
    let reply = async {
        while let Some(Ok(message)) = stream.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    };
    if tokio::time::timeout(CLOSE_GRACE, reply).await.is_err() {
        debug!("Realtime server did not answer close, dropping the socket");
    }
}

fn handle_server_event(text: &str, shared: &SessionShared) {
    let event = match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            debug!(error = %err, "Ignoring unparsable realtime event");
            return;
        }
    };

    match event {
        ServerEvent::AudioDelta { delta } => match BASE64.decode(delta.as_bytes()) {
            Ok(bytes) => shared.emit(UpstreamEvent::Audio(AudioFrame::new(bytes))),
            Err(err) => warn!(error = %err, "Audio delta is not valid base64"),
        },
        ServerEvent::Error { error } => {
            warn!(code = ?error.code, detail = %error.message, "Realtime API reported an error");
        }
        ServerEvent::SessionCreated => debug!("Realtime session created"),
        ServerEvent::SessionUpdated => debug!("Realtime session configuration applied"),
        ServerEvent::SpeechStarted => debug!("Speech started"),
        ServerEvent::Other => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn session_config() -> SessionConfig {
        SessionConfig {
            instructions: "You are Atlas.".to_string(),
            voice: None,
            turn_detection: Some(TurnDetection {
                mode: "server_vad".to_string(),
                interrupt_response: true,
                threshold: 0.5,
                prefix_padding_ms: 500,
                silence_duration_ms: 500,
            }),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<UpstreamEvent>) -> UpstreamEvent {
        timeout(TIMEOUT, events.recv())
            .await
            .expect("timeout waiting for upstream event")
            .expect("event stream ended")
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            let msg = timeout(TIMEOUT, ws.next())
                .await
                .expect("timeout waiting for client event")
                .expect("stream closed")
                .expect("ws error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_session_update_payload() {
        let update = ClientEvent::SessionUpdate {
            session: SessionUpdate::from_config(&session_config()),
        };
        let json: Value = serde_json::to_value(&update).unwrap();

        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["instructions"], "You are Atlas.");
        assert_eq!(json["session"]["input_audio_format"], "pcm16");
        assert_eq!(json["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(json["session"]["turn_detection"]["prefix_padding_ms"], 500);
        assert_eq!(json["session"]["turn_detection"]["interrupt_response"], true);
        assert!(json["session"].get("voice").is_none());
    }

    #[test]
    fn test_server_event_parsing() {
        let delta = r#"{"type":"response.audio.delta","response_id":"r1","delta":"AAE="}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(delta).unwrap(),
            ServerEvent::AudioDelta { delta } if delta == "AAE="
        ));

        let ga_delta = r#"{"type":"response.output_audio.delta","delta":"AAE="}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(ga_delta).unwrap(),
            ServerEvent::AudioDelta { .. }
        ));

        let other = r#"{"type":"response.done","response":{}}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(other).unwrap(),
            ServerEvent::Other
        ));
    }

    #[test]
    fn test_endpoint_includes_model() {
        let endpoint = |url: &str, model: &str| {
            RealtimeConnector::new(url, model).endpoint().unwrap().to_string()
        };

        assert_eq!(
            endpoint("wss://api.example.com/v1/realtime", "gpt-test"),
            "wss://api.example.com/v1/realtime?model=gpt-test"
        );
        assert_eq!(endpoint("ws://localhost/rt?x=1", "m"), "ws://localhost/rt?x=1&model=m");

        // No path at all still yields a valid request target.
        assert_eq!(endpoint("ws://127.0.0.1:9000", "gpt-test"), "ws://127.0.0.1:9000/?model=gpt-test");
        assert_eq!(endpoint("ws://127.0.0.1:9000", ""), "ws://127.0.0.1:9000/");

        assert_eq!(
            endpoint("wss://api.example.com/v1/realtime", "gpt test&x=1"),
            "wss://api.example.com/v1/realtime?model=gpt+test%26x%3D1"
        );
    }

    #[test]
    fn test_unparsable_url_is_connect_error() {
        let connector = RealtimeConnector::new("not a url", "gpt-test");
        assert!(matches!(connector.endpoint(), Err(RelayError::UpstreamConnect(_))));
    }

    #[tokio::test]
    async fn test_session_relays_audio_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut auth = None;
            let mut beta = None;
            let mut ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
                auth = req.headers().get("authorization").map(|v| v.to_str().unwrap().to_string());
                beta = req.headers().get("openai-beta").map(|v| v.to_str().unwrap().to_string());
                Ok(resp)
            })
            .await
            .unwrap();

            let update = next_json(&mut ws).await;
            let append = next_json(&mut ws).await;

            // 0x0100, 0x0302 as base64
            let delta = serde_json::json!({"type": "response.audio.delta", "delta": "AAECAw=="});
            ws.send(Message::Text(delta.to_string())).await.unwrap();
            ws.close(None).await.unwrap();

            (auth, beta, update, append)
        });

        let connector = RealtimeConnector::new(format!("ws://{}", addr), "gpt-test");
        let link = connector
            .connect(ApiCredential::new("sk-test"), session_config())
            .await
            .unwrap();
        let mut events = link.events;

        assert_eq!(
            next_event(&mut events).await,
            UpstreamEvent::StateChanged(UpstreamState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            UpstreamEvent::StateChanged(UpstreamState::Connected)
        );

        link.session.send_audio(AudioFrame::new(vec![1u8, 0, 2, 0]));

        assert_eq!(
            next_event(&mut events).await,
            UpstreamEvent::Audio(AudioFrame::new(vec![0u8, 1, 2, 3]))
        );
        assert_eq!(
            next_event(&mut events).await,
            UpstreamEvent::StateChanged(UpstreamState::Disconnected)
        );

        let (auth, beta, update, append) = timeout(TIMEOUT, server).await.unwrap().unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
        assert_eq!(beta.as_deref(), Some("realtime=v1"));
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["instructions"], "You are Atlas.");
        assert_eq!(append["type"], "input_audio_buffer.append");
        assert_eq!(append["audio"], BASE64.encode([1u8, 0, 2, 0]));

        link.session.close();
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = accept_hdr_async(stream, |_req: &Request, _resp: Response| {
                let rejection: ErrorResponse = tungstenite::http::Response::builder()
                    .status(401)
                    .body(Some("invalid_api_key".to_string()))
                    .unwrap();
                Err(rejection)
            })
            .await;
        });

        let connector = RealtimeConnector::new(format!("ws://{}", addr), "gpt-test");
        let result = connector
            .connect(ApiCredential::new("sk-bad"), session_config())
            .await;

        match result {
            Err(RelayError::UpstreamConnect(msg)) => assert!(msg.contains("401"), "{}", msg),
            other => panic!("expected UpstreamConnect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drops_late_audio() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _update = next_json(&mut ws).await;

            let mut seen = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                let is_close = matches!(msg, Message::Close(_));
                seen.push(msg);
                if is_close {
                    break;
                }
            }
            seen
        });

        let connector = RealtimeConnector::new(format!("ws://{}", addr), "");
        let link = connector
            .connect(ApiCredential::new("sk-test"), session_config())
            .await
            .unwrap();
        let mut events = link.events;

        link.session.close();
        link.session.close();
        link.session.send_audio(AudioFrame::new(vec![9u8; 4]));

        let seen = timeout(TIMEOUT, server).await.unwrap().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Message::Close(_)));

        let mut disconnects = 0;
        while let Ok(Some(event)) = timeout(Duration::from_millis(500), events.recv()).await {
            if event == UpstreamEvent::StateChanged(UpstreamState::Disconnected) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_unanswered_close_still_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _update = next_json(&mut ws).await;

            // Stop reading, so our close frame is never answered.
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(ws);
        });

        let connector = RealtimeConnector::new(format!("ws://{}", addr), "gpt-test");
        let link = connector
            .connect(ApiCredential::new("sk-test"), session_config())
            .await
            .unwrap();
        let mut events = link.events;
        assert_eq!(
            next_event(&mut events).await,
            UpstreamEvent::StateChanged(UpstreamState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            UpstreamEvent::StateChanged(UpstreamState::Connected)
        );

        let started = tokio::time::Instant::now();
        link.session.close();

        let event = timeout(CLOSE_GRACE + Duration::from_secs(2), events.recv())
            .await
            .expect("session stayed open after an unanswered close");
        assert_eq!(event, Some(UpstreamEvent::StateChanged(UpstreamState::Disconnected)));
        assert!(started.elapsed() >= CLOSE_GRACE - Duration::from_millis(100));

        server.abort();
    }
}
