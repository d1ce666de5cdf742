//! Per-model worker slots over a shared inference backend

use super::{InferenceBackend, ModelStatus};
use crate::catalog::{ModelCatalog, ModelSpec};
use crate::error::{BackendError, InferenceError};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Slot bookkeeping for one model
#[derive(Debug)]
struct ModelSlots {
    spec: Arc<ModelSpec>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    busy: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of one model's slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSlotStats {
    pub model: String,
    pub capacity: usize,
    pub busy: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Bounded worker pool sized per model.
///
/// Each model gets `workers` slots (the catalog value, or the pool default).
/// A slot is held for the duration of one `infer` call, so a slow model
/// never starves another.
pub struct BackendPool {
    backend: Arc<dyn InferenceBackend>,
    slots: HashMap<String, Arc<ModelSlots>>,
}

impl BackendPool {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        catalog: &ModelCatalog,
        default_workers: usize,
    ) -> Self {
        let slots = catalog
            .iter()
            .map(|spec| {
                let capacity = spec.workers.unwrap_or(default_workers).max(1);
                let slots = ModelSlots {
                    spec: Arc::clone(spec),
                    semaphore: Arc::new(Semaphore::new(capacity)),
                    capacity,
                    busy: AtomicUsize::new(0),
                    completed: AtomicU64::new(0),
                    failed: AtomicU64::new(0),
                };
                (spec.name.clone(), Arc::new(slots))
            })
            .collect();

        Self { backend, slots }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Waits for a free slot of `model`.
    ///
    /// Returns `None` for a model the pool was not built with.
    pub async fn acquire(&self, model: &str) -> Option<SlotGuard> {
        let slots = Arc::clone(self.slots.get(model)?);
        let permit = Arc::clone(&slots.semaphore).acquire_owned().await.ok()?;
        slots.busy.fetch_add(1, Ordering::Relaxed);
        trace!(model, busy = slots.busy.load(Ordering::Relaxed), "slot acquired");

        Some(SlotGuard {
            backend: Arc::clone(&self.backend),
            slots,
            _permit: permit,
        })
    }

    /// Queries the backend for the status of every model, in name order.
    pub async fn check_models(&self) -> Vec<(String, Result<ModelStatus, BackendError>)> {
        let mut names: Vec<&String> = self.slots.keys().collect();
        names.sort();

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            let spec = &self.slots[name].spec;
            let status = self.backend.model_status(spec).await;
            if let Err(e) = &status {
                warn!(model = %name, "status check failed: {}", e);
            }
            statuses.push((name.clone(), status));
        }
        statuses
    }

    pub fn stats(&self) -> Vec<ModelSlotStats> {
        let mut stats: Vec<ModelSlotStats> = self
            .slots
            .iter()
            .map(|(name, slots)| ModelSlotStats {
                model: name.clone(),
                capacity: slots.capacity,
                busy: slots.busy.load(Ordering::Relaxed),
                completed: slots.completed.load(Ordering::Relaxed),
                failed: slots.failed.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| a.model.cmp(&b.model));
        stats
    }
}

/// A held backend slot. The slot is returned to the pool on drop.
pub struct SlotGuard {
    backend: Arc<dyn InferenceBackend>,
    slots: Arc<ModelSlots>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    /// Runs `infer` for this slot's model.
    ///
    /// A cancelled call drops the backend future; the backend sees the
    /// request abandoned and nothing is delivered.
    pub async fn run(
        self,
        image: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, InferenceError> {
        let spec = Arc::clone(&self.slots.spec);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(model = %spec.name, "inference interrupted by cancellation");
                return Err(InferenceError::cancelled());
            }
            result = self.backend.infer(&spec, image) => result,
        };

        match result {
            Ok(vector) => {
                self.slots.completed.fetch_add(1, Ordering::Relaxed);
                Ok(vector)
            }
            Err(e) => {
                self.slots.failed.fetch_add(1, Ordering::Relaxed);
                debug!(model = %spec.name, "inference failed: {}", e);
                Err(e.into())
            }
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.busy.fetch_sub(1, Ordering::Relaxed);
    }
}
