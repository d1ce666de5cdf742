//! Streaming image-embedding gateway.
//!
//! Clients open a bidirectional `Predict` stream, push image requests tagged
//! with their own ids and receive embedding vectors correlated by id. The
//! gateway bounds in-flight work per session, queues work per model and runs
//! it on a pluggable inference backend.

pub mod backend;
pub mod catalog;
pub mod cli;
pub mod codec;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod session;

// Re-export commonly used types
pub use backend::{BackendPool, InferenceBackend, ModelStatus, TfServingBackend};
pub use catalog::{ModelCatalog, ModelSpec};
pub use codec::{ImagePredictionClient, PredictionRequest, VectorResponse};
pub use config::ServiceConfig;
pub use error::{BackendError, Error, ErrorKind, InferenceError, Result};
pub use registry::{SessionId, SessionRegistry};
pub use service::{Gateway, GatewaySettings, PredictionService};
pub use session::{SessionContext, SessionEnd, SessionSettings, SessionSummary, StreamSession};
