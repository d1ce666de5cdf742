//! Gateway metrics for sessions, requests and per-kind errors.
//!
//! This module provides:
//! - `GatewayMetrics`: lock-free counters updated from the session loops
//! - `MetricsSnapshot`: a serializable point-in-time copy of the counters
//! - `spawn_reporter`: a background task that periodically logs the
//!   snapshot together with registry liveness, lane depths and backend
//!   slot usage
//!
//! Counters are monotonic for the lifetime of the process. Callers derive
//! rates by diffing consecutive snapshots.

use crate::backend::{BackendPool, ModelSlotStats};
use crate::dispatcher::{Dispatcher, LaneDepth};
use crate::error::{ErrorKind, InferenceError};
use crate::registry::SessionRegistry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Process-wide gateway counters.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    requests_accepted: AtomicU64,
    responses_ok: AtomicU64,
    responses_dropped: AtomicU64,
    errors: [AtomicU64; ErrorKind::ALL.len()],
}

/// Serializable copy of [`GatewayMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub requests_accepted: u64,
    pub responses_ok: u64,
    /// Results discarded because the session could no longer write
    pub responses_dropped: u64,
    /// Overloaded rejections (also counted in `errors`)
    pub overloaded: u64,
    /// Error responses keyed by error kind
    pub errors: BTreeMap<&'static str, u64>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_accepted(&self) {
        self.requests_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a response written to a client
    pub fn record_response(&self, result: &Result<Vec<f32>, InferenceError>) {
        match result {
            Ok(_) => {
                self.responses_ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.errors[Self::slot(err.kind)].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn response_dropped(&self) {
        self.responses_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors[Self::slot(kind)].load(Ordering::Relaxed)
    }

    fn slot(kind: ErrorKind) -> usize {
        ErrorKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors = ErrorKind::ALL
            .iter()
            .map(|kind| (kind.as_str(), self.errors(*kind)))
            .collect();

        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            requests_accepted: self.requests_accepted.load(Ordering::Relaxed),
            responses_ok: self.responses_ok.load(Ordering::Relaxed),
            responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
            overloaded: self.errors(ErrorKind::Overloaded),
            errors,
        }
    }
}

/// Liveness report logged by the reporter task
#[derive(Debug, Serialize)]
struct Report<'a> {
    #[serde(flatten)]
    counters: &'a MetricsSnapshot,
    live_sessions: usize,
    in_flight: usize,
    queues: Vec<LaneDepth>,
    models: Vec<ModelSlotStats>,
}

/// Shared state the reporter reads on every tick
#[derive(Clone)]
pub struct ReportSources {
    pub metrics: Arc<GatewayMetrics>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub pool: Arc<BackendPool>,
}

impl ReportSources {
    /// Renders the current report as one JSON line
    pub fn render(&self) -> serde_json::Result<String> {
        let snapshot = self.metrics.snapshot();
        let report = Report {
            counters: &snapshot,
            live_sessions: self.registry.len(),
            in_flight: self.registry.total_in_flight(),
            queues: self.dispatcher.queue_depths(),
            models: self.pool.stats(),
        };
        serde_json::to_string(&report)
    }
}

/// Spawns the periodic metrics reporter.
///
/// The task ends when `shutdown` is cancelled.
pub fn spawn_reporter(
    sources: ReportSources,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match sources.render() {
                Ok(json) => info!(target: "embedstream::metrics", "{}", json),
                Err(e) => {
                    warn!(target: "embedstream::metrics", "metrics serialization failed: {}", e)
                }
            }
        }
    })
}
