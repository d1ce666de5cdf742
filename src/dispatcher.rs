//! Inference dispatcher: routes tasks to per-model queues and runs them on
//! the backend pool.
//!
//! Each catalog model owns a bounded FIFO lane and one pump task. The pump
//! pops tasks in submission order, waits for a backend slot of that model,
//! and runs the inference on its own task so the lane keeps moving. Lanes
//! are independent; a saturated model never delays another.
//!
//! Every [`InferenceTask`] carries a [`Completion`] that fires exactly once:
//! with the backend result, with an immediate rejection from
//! [`Dispatcher::submit`], or with `Cancelled` when the task is dropped
//! unfinished.

use crate::backend::BackendPool;
use crate::catalog::ModelCatalog;
use crate::codec::PredictionRequest;
use crate::error::InferenceError;
use crate::registry::SessionId;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A finished task on its way back to the owning session
#[derive(Debug)]
pub struct Finished {
    pub id: i64,
    pub result: Result<Vec<f32>, InferenceError>,
    /// Session in-flight slot, released once the response is written
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Completion path of one task.
///
/// Consumed by [`Completion::complete`]. Dropping an unfired completion
/// delivers `Cancelled`, so a task can never finish silently.
#[derive(Debug)]
pub struct Completion {
    inner: Option<CompletionInner>,
}

#[derive(Debug)]
struct CompletionInner {
    id: i64,
    tx: mpsc::Sender<Finished>,
    permit: Option<OwnedSemaphorePermit>,
}

impl CompletionInner {
    fn deliver(self, result: Result<Vec<f32>, InferenceError>) {
        let finished = Finished {
            id: self.id,
            result,
            permit: self.permit,
        };
        match self.tx.try_send(finished) {
            Ok(()) => {}
            Err(TrySendError::Closed(finished)) => {
                trace!(id = finished.id, "session gone, dropping result");
            }
            Err(TrySendError::Full(finished)) => match Handle::try_current() {
                Ok(handle) => {
                    trace!(id = finished.id, "completion channel full, delivering later");
                    let tx = self.tx;
                    handle.spawn(async move {
                        let _ = tx.send(finished).await;
                    });
                }
                Err(_) => {
                    warn!(id = finished.id, "completion channel full, dropping result");
                }
            },
        }
    }
}

impl Completion {
    /// Creates the completion for request `id`.
    ///
    /// Sessions size `tx` to their in-flight ceiling and pass the slot
    /// `permit`, so delivery never waits. Completions without a permit may
    /// outnumber the channel capacity; a result that finds the channel full
    /// is handed to a task that waits for room, and is only dropped when no
    /// runtime is available.
    pub fn new(
        id: i64,
        tx: mpsc::Sender<Finished>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            inner: Some(CompletionInner { id, tx, permit }),
        }
    }

    pub fn complete(mut self, result: Result<Vec<f32>, InferenceError>) {
        if let Some(inner) = self.inner.take() {
            inner.deliver(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.deliver(Err(InferenceError::cancelled()));
        }
    }
}

/// In-flight unit binding a request to its owning session.
#[derive(Debug)]
pub struct InferenceTask {
    pub session: SessionId,
    pub id: i64,
    pub model: String,
    pub image: Bytes,
    pub cancel: CancellationToken,
    pub completion: Completion,
    pub submitted_at: Instant,
}

impl InferenceTask {
    pub fn new(
        session: SessionId,
        request: PredictionRequest,
        cancel: CancellationToken,
        completion: Completion,
    ) -> Self {
        Self {
            session,
            id: request.id,
            model: request.model,
            image: request.image,
            cancel,
            completion,
            submitted_at: Instant::now(),
        }
    }
}

/// Occupancy of one model lane
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneDepth {
    pub model: String,
    pub depth: usize,
    pub capacity: usize,
}

struct ModelLane {
    tx: mpsc::Sender<InferenceTask>,
    capacity: usize,
    depth: Arc<AtomicUsize>,
}

/// Routes tasks to per-model lanes.
pub struct Dispatcher {
    lanes: HashMap<String, ModelLane>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Creates one lane and pump per catalog model.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        pool: Arc<BackendPool>,
        catalog: &ModelCatalog,
        default_queue_capacity: usize,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let mut lanes = HashMap::with_capacity(catalog.len());

        for spec in catalog.iter() {
            let capacity = spec.queue_capacity.unwrap_or(default_queue_capacity).max(1);
            let (tx, rx) = mpsc::channel(capacity);
            let depth = Arc::new(AtomicUsize::new(0));

            tokio::spawn(pump(
                spec.name.clone(),
                rx,
                Arc::clone(&pool),
                Arc::clone(&depth),
                shutdown.clone(),
            ));

            lanes.insert(spec.name.clone(), ModelLane { tx, capacity, depth });
        }

        Self { lanes, shutdown }
    }

    /// Enqueues `task` without waiting.
    ///
    /// Unknown models complete with `ModelNotFound` and full lanes with
    /// `Overloaded`, immediately and correlated by id.
    pub fn submit(&self, task: InferenceTask) {
        let Some(lane) = self.lanes.get(&task.model) else {
            debug!(session = %task.session, id = task.id, model = %task.model, "unknown model");
            let err = InferenceError::model_not_found(&task.model);
            task.completion.complete(Err(err));
            return;
        };

        lane.depth.fetch_add(1, Ordering::AcqRel);
        match lane.tx.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                lane.depth.fetch_sub(1, Ordering::AcqRel);
                debug!(session = %task.session, id = task.id, model = %task.model, "queue full");
                let err = InferenceError::overloaded(&task.model);
                task.completion.complete(Err(err));
            }
            Err(TrySendError::Closed(task)) => {
                lane.depth.fetch_sub(1, Ordering::AcqRel);
                task.completion.complete(Err(InferenceError::cancelled()));
            }
        }
    }

    /// Queued (not yet started) tasks per model, in name order
    pub fn queue_depths(&self) -> Vec<LaneDepth> {
        let mut depths: Vec<LaneDepth> = self
            .lanes
            .iter()
            .map(|(name, lane)| LaneDepth {
                model: name.clone(),
                depth: lane.depth.load(Ordering::Acquire),
                capacity: lane.capacity,
            })
            .collect();
        depths.sort_by(|a, b| a.model.cmp(&b.model));
        depths
    }

    /// Stops every pump. Queued tasks complete with `Cancelled`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Services one model lane in FIFO order
async fn pump(
    model: String,
    mut rx: mpsc::Receiver<InferenceTask>,
    pool: Arc<BackendPool>,
    depth: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    debug!(model = %model, "dispatcher lane started");

    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        depth.fetch_sub(1, Ordering::AcqRel);

        if task.cancel.is_cancelled() {
            task.completion.complete(Err(InferenceError::cancelled()));
            continue;
        }

        let cancel = task.cancel.clone();
        let slot = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                task.completion.complete(Err(InferenceError::cancelled()));
                break;
            }
            _ = cancel.cancelled() => {
                task.completion.complete(Err(InferenceError::cancelled()));
                continue;
            }
            slot = pool.acquire(&model) => slot,
        };

        let Some(slot) = slot else {
            task.completion.complete(Err(InferenceError::model_not_found(&model)));
            continue;
        };

        trace!(
            session = %task.session,
            id = task.id,
            model = %model,
            queued_ms = task.submitted_at.elapsed().as_millis() as u64,
            "task started"
        );

        tokio::spawn(async move {
            let InferenceTask {
                image,
                cancel,
                completion,
                ..
            } = task;
            let result = slot.run(image, &cancel).await;
            completion.complete(result);
        });
    }

    // Tasks left in the lane drop here and complete as cancelled
    rx.close();
    while let Ok(task) = rx.try_recv() {
        depth.fetch_sub(1, Ordering::AcqRel);
        task.completion.complete(Err(InferenceError::cancelled()));
    }
    debug!(model = %model, "dispatcher lane stopped");
}
