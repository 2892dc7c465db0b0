//! # Application State Management
//!
//! This module holds everything the listener hands to each new relay: the
//! read-only configuration, the backend credential, the upstream connector,
//! the optional instruction resolver, and a set of counters for `/health`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every relay actor hold the same connector and config
//! - **Why needed**: actix runs one actor per connection, possibly on several workers
//!
//! ### Atomics instead of RwLock
//! - **Purpose**: Counters are bumped from many relays at once
//! - **Why atomics**: Relays never wait on each other. There is no lock a slow
//!   connection could hold while a fast one waits
//!
//! ### RAII guards
//! - **SessionPermit**: Holding a permit *is* being counted as an active
//!   session. Dropping it (on any exit path) releases the slot
//!
//! ## What is *not* here:
//! Per-connection state (the upstream session, the lifecycle state) lives in
//! the relay actor that owns the connection, never in this shared struct.

use crate::config::{ApiCredential, AppConfig};
use crate::instructions::InstructionResolver;
use crate::upstream::UpstreamConnector;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared, read-mostly state cloned into every relay.
#[derive(Clone)]
pub struct AppState {
    /// Configuration, fixed after startup
    pub config: Arc<AppConfig>,

    /// Backend API key, read-only for the life of the process
    pub credential: ApiCredential,

    /// Opens upstream voice sessions
    pub connector: Arc<dyn UpstreamConnector>,

    /// Fetches per-meeting instructions; `None` in the simple variant
    pub resolver: Option<Arc<dyn InstructionResolver>>,

    /// Process-wide counters
    pub metrics: Arc<RelayMetrics>,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        credential: ApiCredential,
        connector: Arc<dyn UpstreamConnector>,
        resolver: Option<Arc<dyn InstructionResolver>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            credential,
            connector,
            resolver,
            metrics: Arc::new(RelayMetrics::default()),
            start_time: Instant::now(),
        }
    }

    /// Whether connections must carry a `meeting_id` query parameter.
    pub fn requires_meeting_id(&self) -> bool {
        self.resolver.is_some()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Counters describing relay activity since startup.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    accepted_connections: AtomicU64,
    rejected_connections: AtomicU64,
    active_sessions: AtomicUsize,
    relays_established: AtomicU64,
    upstream_connect_failures: AtomicU64,
    frames_to_upstream: AtomicU64,
    frames_to_client: AtomicU64,
    bytes_to_upstream: AtomicU64,
    bytes_to_client: AtomicU64,
}

/// A point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub accepted_connections: u64,
    pub rejected_connections: u64,
    pub active_sessions: usize,
    pub relays_established: u64,
    pub upstream_connect_failures: u64,
    pub frames_to_upstream: u64,
    pub frames_to_client: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
}

impl RelayMetrics {
    /// Reserve one of `max` session slots.
    ///
    /// ## Returns:
    /// - **Some(permit)**: A slot was free; it stays taken until the permit is dropped
    /// - **None**: All slots are in use
    pub fn try_acquire_session(self: &Arc<Self>, max: usize) -> Option<SessionPermit> {
        let mut current = self.active_sessions.load(Ordering::SeqCst);
        loop {
            if current >= max {
                return None;
            }
            match self.active_sessions.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(SessionPermit {
                        metrics: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn record_accepted(&self) {
        self.accepted_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_established(&self) {
        self.relays_established.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_connect_failure(&self) {
        self.upstream_connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_to_upstream(&self, bytes: usize) {
        self.frames_to_upstream.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_upstream.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame_to_client(&self, bytes: usize) {
        self.frames_to_client.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted_connections: self.accepted_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::SeqCst),
            relays_established: self.relays_established.load(Ordering::SeqCst),
            upstream_connect_failures: self.upstream_connect_failures.load(Ordering::Relaxed),
            frames_to_upstream: self.frames_to_upstream.load(Ordering::Relaxed),
            frames_to_client: self.frames_to_client.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

/// One occupied session slot. Released on drop.
#[derive(Debug)]
pub struct SessionPermit {
    metrics: Arc<RelayMetrics>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.metrics.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
