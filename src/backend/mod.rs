//! Inference backends and the slot pool that shares them across sessions.
//!
//! The gateway never computes embeddings itself. A backend implements
//! [`InferenceBackend`] and is handed to the [`BackendPool`] at construction,
//! so tests can substitute a deterministic fake.

pub mod pool;
pub mod tf_serving;

pub use pool::{BackendPool, ModelSlotStats};
pub use tf_serving::TfServingBackend;

use crate::catalog::ModelSpec;
use crate::config::{BackendConfig, BackendKind};
use crate::error::{BackendError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Readiness of a model on the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    /// Model is loaded and serving
    Available,
    /// Backend reports the model as not servable
    Unavailable(String),
}

/// The `infer(model, image) -> vector` collaborator.
#[async_trait]
pub trait InferenceBackend: Send + Sync + 'static {
    /// Computes the embedding for one image.
    ///
    /// Must report [`BackendError::Unavailable`] when the model cannot be
    /// served, distinct from [`BackendError::Failure`] for a failed
    /// computation. Callers never retry automatically.
    async fn infer(
        &self,
        model: &ModelSpec,
        image: Bytes,
    ) -> std::result::Result<Vec<f32>, BackendError>;

    /// Reports whether the backend can currently serve `model`.
    async fn model_status(
        &self,
        _model: &ModelSpec,
    ) -> std::result::Result<ModelStatus, BackendError> {
        Ok(ModelStatus::Available)
    }

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Creates the backend selected by configuration
pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn InferenceBackend>> {
    match config.kind {
        BackendKind::TfServing => {
            let backend = TfServingBackend::new(&config.url, config.timeout())?;
            Ok(Arc::new(backend))
        }
    }
}
