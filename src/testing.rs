//! Test doubles for the upstream backend and the instruction store.

use crate::audio::AudioFrame;
use crate::config::{ApiCredential, AppConfig};
use crate::error::RelayError;
use crate::instructions::{InstructionResolver, SessionInstructions};
use crate::state::AppState;
use crate::upstream::{
    SessionConfig, UpstreamConnector, UpstreamEvent, UpstreamLink, UpstreamSession, UpstreamState,
};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Records everything a relay does to its upstream and lets tests push events back.
#[derive(Default)]
pub struct MockUpstream {
    sent: Mutex<Vec<AudioFrame>>,
    configs: Mutex<Vec<SessionConfig>>,
    credentials: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<UpstreamEvent>>>,
    close_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    fail_with: Mutex<Option<String>>,
    hang: AtomicBool,
}

impl MockUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every connect attempt fails with `UpstreamConnect(reason)`.
    pub fn failing(reason: &str) -> Arc<Self> {
        let upstream = Self::default();
        *upstream.fail_with.lock().unwrap() = Some(reason.to_string());
        Arc::new(upstream)
    }

    /// Every connect attempt never completes.
    pub fn hanging() -> Arc<Self> {
        let upstream = Self::default();
        upstream.hang.store(true, Ordering::SeqCst);
        Arc::new(upstream)
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn UpstreamConnector> {
        Arc::new(MockConnector(Arc::clone(self)))
    }

    /// A session that is not tied to any connector call.
    pub fn session(self: &Arc<Self>) -> Box<dyn UpstreamSession> {
        Box::new(MockSession {
            upstream: Arc::clone(self),
            closed: AtomicBool::new(false),
        })
    }

    /// Push an event to the most recently connected relay.
    pub fn emit(&self, event: UpstreamEvent) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the event sender, ending the relay's event stream.
    pub fn end_events(&self) {
        self.events.lock().unwrap().take();
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|frame| frame.as_bytes().to_vec())
            .collect()
    }

    pub fn configs(&self) -> Vec<SessionConfig> {
        self.configs.lock().unwrap().clone()
    }

    pub fn credentials(&self) -> Vec<String> {
        self.credentials.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

struct MockConnector(Arc<MockUpstream>);

impl UpstreamConnector for MockConnector {
    fn connect(
        &self,
        credential: ApiCredential,
        config: SessionConfig,
    ) -> BoxFuture<'static, Result<UpstreamLink, RelayError>> {
        let upstream = Arc::clone(&self.0);

        Box::pin(async move {
            upstream.connect_calls.fetch_add(1, Ordering::SeqCst);
            upstream.credentials.lock().unwrap().push(credential.expose().to_string());
            upstream.configs.lock().unwrap().push(config);

            if upstream.hang.load(Ordering::SeqCst) {
                futures_util::future::pending::<()>().await;
            }

            let failure = upstream.fail_with.lock().unwrap().clone();
            if let Some(reason) = failure {
                return Err(RelayError::UpstreamConnect(reason));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(UpstreamEvent::StateChanged(UpstreamState::Connected));
            *upstream.events.lock().unwrap() = Some(tx);

            Ok(UpstreamLink {
                session: upstream.session(),
                events: rx,
            })
        })
    }
}

struct MockSession {
    upstream: Arc<MockUpstream>,
    closed: AtomicBool,
}

impl UpstreamSession for MockSession {
    fn send_audio(&self, frame: AudioFrame) {
        if !self.closed.load(Ordering::SeqCst) {
            self.upstream.sent.lock().unwrap().push(frame);
        }
    }

    fn close(&self) {
        self.upstream.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Instruction resolver that answers from memory and counts lookups.
pub struct MockResolver {
    answer: Result<String, String>,
    calls: AtomicUsize,
    meeting_ids: Mutex<Vec<String>>,
}

impl MockResolver {
    pub fn answering(instructions: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(instructions.to_string()),
            calls: AtomicUsize::new(0),
            meeting_ids: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Err(reason.to_string()),
            calls: AtomicUsize::new(0),
            meeting_ids: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn meeting_ids(&self) -> Vec<String> {
        self.meeting_ids.lock().unwrap().clone()
    }
}

impl InstructionResolver for MockResolver {
    fn resolve(&self, meeting_id: &str) -> BoxFuture<'static, Result<SessionInstructions, RelayError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.meeting_ids.lock().unwrap().push(meeting_id.to_string());

        let answer = self.answer.clone();
        Box::pin(async move {
            answer
                .map(|instructions| SessionInstructions { instructions })
                .map_err(RelayError::ConfigResolution)
        })
    }
}

/// State wired to the given doubles with a short connect timeout.
pub fn test_state(
    connector: Arc<dyn UpstreamConnector>,
    resolver: Option<Arc<dyn InstructionResolver>>,
) -> AppState {
    let mut config = AppConfig::default();
    config.upstream.connect_timeout_secs = 2;
    AppState::new(config, ApiCredential::new("sk-test"), connector, resolver)
}

/// Poll `condition` every 10ms for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
