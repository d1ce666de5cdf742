//! Model catalog: the set of model names the gateway will route.
//!
//! Each entry carries what the backend needs to address the model
//! (version, input tensor name) and the per-model resource bounds used by
//! the dispatcher and the backend pool.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A model served by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Name clients put in `PredictionRequest.model`
    pub name: String,
    /// Backend model version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Name of the backend input the base64 image is bound to
    #[serde(default = "default_input_name")]
    pub input_name: String,
    /// Backend slots for this model (falls back to the dispatcher default)
    #[serde(default)]
    pub workers: Option<usize>,
    /// Dispatcher queue bound for this model (falls back to the dispatcher default)
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

fn default_version() -> u32 {
    1
}

fn default_input_name() -> String {
    "b64_input_bytes".to_string()
}

impl ModelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            input_name: default_input_name(),
            workers: None,
            queue_capacity: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }
}

/// Immutable name → model lookup shared by the dispatcher and the pool.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, Arc<ModelSpec>>,
}

impl ModelCatalog {
    /// Builds a catalog, rejecting duplicate or empty model names.
    pub fn from_specs(specs: impl IntoIterator<Item = ModelSpec>) -> Result<Self> {
        let mut models = HashMap::new();
        for spec in specs {
            if spec.name.is_empty() {
                return Err(Error::Config("model name must not be empty".to_string()));
            }
            if models.contains_key(&spec.name) {
                return Err(Error::Config(format!("Duplicate model name: {}", spec.name)));
            }
            models.insert(spec.name.clone(), Arc::new(spec));
        }
        Ok(Self { models })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ModelSpec>> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Model names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelSpec>> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
