//! Process-wide table of live stream sessions.
//!
//! This module provides:
//! - `SessionRegistry` for lifecycle management, liveness and shutdown broadcast
//! - `SessionRegistration` RAII guard that removes the session when dropped
//! - `SessionInfo` snapshots for logging and metrics
//!
//! # Usage
//!
//! ```ignore
//! let registry = Arc::new(SessionRegistry::new());
//!
//! // Sessions self-register on open
//! let registration = registry.register(peer);
//!
//! // On shutdown, drain for up to the grace period, then force-cancel
//! let report = registry.shutdown_all(Duration::from_secs(10)).await;
//! ```
//!
//! The registry is owned by the server and shared through `Arc`; only
//! `register` and the guard's drop mutate the table.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session identifier, unique for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting requests
    Open,
    /// No longer accepting; draining in-flight work
    Closing,
    /// Both loops finished
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Open,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Counters a session updates from its own loops and the registry reads.
#[derive(Debug)]
pub struct SessionShared {
    state: AtomicU8,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    accepted: AtomicU64,
    responses: AtomicU64,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Open as u8),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            responses: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Records an accepted request and returns the new in-flight count.
    pub fn request_accepted(&self) -> usize {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::AcqRel);
        in_flight
    }

    /// Records a response leaving the session (written or dropped).
    pub fn request_finished(&self, written: bool) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if written {
            self.responses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn responses(&self) -> u64 {
        self.responses.load(Ordering::Relaxed)
    }
}

/// Registry entry for one session
#[derive(Debug, Clone)]
struct SessionHandle {
    peer: Option<SocketAddr>,
    opened_at: DateTime<Utc>,
    shared: Arc<SessionShared>,
    /// Stop accepting and drain
    shutdown: CancellationToken,
    /// Cancel everything still in flight
    cancel: CancellationToken,
}

/// Point-in-time description of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: Option<SocketAddr>,
    pub opened_at: DateTime<Utc>,
    pub state: SessionState,
    pub in_flight: usize,
    pub accepted: u64,
}

/// Outcome of [`SessionRegistry::shutdown_all`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions live when shutdown started
    pub sessions: usize,
    /// Sessions still live at the grace deadline and force-cancelled
    pub forced: usize,
}

/// Table of active sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
    changed: Notify,
    shutdown: CancellationToken,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            changed: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers a new session and returns its guard.
    ///
    /// Sessions registered after shutdown started get an already-cancelled
    /// shutdown token and close immediately.
    pub fn register(self: &Arc<Self>, peer: Option<SocketAddr>) -> SessionRegistration {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = SessionHandle {
            peer,
            opened_at: Utc::now(),
            shared: Arc::new(SessionShared::new()),
            shutdown: self.shutdown.child_token(),
            cancel: CancellationToken::new(),
        };

        let registration = SessionRegistration {
            id,
            shared: Arc::clone(&handle.shared),
            shutdown: handle.shutdown.clone(),
            cancel: handle.cancel.clone(),
            registry: Arc::clone(self),
        };

        self.sessions.write().insert(id, handle);
        debug!(session = %id, ?peer, "session registered");
        registration
    }

    fn unregister(&self, id: SessionId) {
        let removed = self.sessions.write().remove(&id);
        if let Some(handle) = removed {
            handle.shared.set_state(SessionState::Closed);
            debug!(session = %id, "session unregistered");
        }
        self.changed.notify_waiters();
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.read().get(&id).map(|h| Self::info(id, h))
    }

    /// Snapshot of every live session, ordered by id
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .iter()
            .map(|(id, h)| Self::info(*id, h))
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    fn info(id: SessionId, handle: &SessionHandle) -> SessionInfo {
        SessionInfo {
            id,
            peer: handle.peer,
            opened_at: handle.opened_at,
            state: handle.shared.state(),
            in_flight: handle.shared.in_flight(),
            accepted: handle.shared.accepted(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// In-flight requests summed over all sessions
    pub fn total_in_flight(&self) -> usize {
        self.sessions.read().values().map(|h| h.shared.in_flight()).sum()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Waits until no session is registered or `timeout` elapses.
    ///
    /// Returns `true` when the registry emptied in time.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.is_empty(),
            }
        }
    }

    /// Broadcasts shutdown to every session.
    ///
    /// Sessions stop accepting and drain in-flight work; whatever is still
    /// live at the grace deadline is cancelled.
    pub async fn shutdown_all(&self, grace: Duration) -> ShutdownReport {
        self.shutdown.cancel();

        let sessions = {
            let sessions = self.sessions.read();
            for (id, handle) in sessions.iter() {
                debug!(session = %id, in_flight = handle.shared.in_flight(), "shutdown signalled");
                handle.shutdown.cancel();
            }
            sessions.len()
        };
        info!("Shutting down {} session(s), grace period {:?}", sessions, grace);

        if self.wait_empty(grace).await {
            return ShutdownReport { sessions, forced: 0 };
        }

        let forced = {
            let sessions = self.sessions.read();
            for (id, handle) in sessions.iter() {
                warn!(
                    session = %id,
                    in_flight = handle.shared.in_flight(),
                    "grace period elapsed, cancelling in-flight requests"
                );
                handle.cancel.cancel();
            }
            sessions.len()
        };

        ShutdownReport { sessions, forced }
    }
}

/// RAII guard for a registered session.
///
/// Dropping the guard removes the session from the registry.
pub struct SessionRegistration {
    id: SessionId,
    shared: Arc<SessionShared>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
}

impl SessionRegistration {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    /// Fires when the server asks the session to stop accepting
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Fires when the session's in-flight work must be abandoned
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for SessionRegistration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
