//! TensorFlow Serving REST backend.
//!
//! Images are sent URL-safe base64 encoded as a single instance; the
//! serving signature returns one prediction row, which is the embedding.

use super::{InferenceBackend, ModelStatus};
use crate::catalog::ModelSpec;
use crate::error::{BackendError, Error, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine};
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Client for the TensorFlow Serving REST API
#[derive(Debug, Clone)]
pub struct TfServingBackend {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    instances: Vec<HashMap<&'a str, String>>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predictions: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    model_version_status: Vec<ModelVersionStatus>,
}

#[derive(Debug, Deserialize)]
struct ModelVersionStatus {
    #[serde(default)]
    state: String,
    status: VersionStatus,
}

#[derive(Debug, Deserialize)]
struct VersionStatus {
    error_code: String,
    #[serde(default)]
    error_message: String,
}

impl TfServingBackend {
    /// Create a client against `base_url` (e.g. `http://localhost:8501/v1`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::Config(format!("Invalid backend url: {}", base_url)));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("embedstream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Backend(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn version_url(&self, model: &ModelSpec) -> String {
        format!("{}/models/{}/versions/{}", self.base_url, model.name, model.version)
    }

    fn transport_error(model: &ModelSpec, err: reqwest::Error) -> BackendError {
        if err.is_connect() || err.is_timeout() {
            BackendError::unavailable(&model.name, err.to_string())
        } else {
            BackendError::failure(err.to_string())
        }
    }

    fn status_error(model: &ModelSpec, status: StatusCode) -> BackendError {
        match status {
            StatusCode::NOT_FOUND | StatusCode::SERVICE_UNAVAILABLE => {
                BackendError::unavailable(&model.name, format!("status code {}", status))
            }
            _ => BackendError::failure(format!(
                "Failed to predict for model {}: status code {}",
                model.name, status
            )),
        }
    }
}

#[async_trait]
impl InferenceBackend for TfServingBackend {
    async fn infer(
        &self,
        model: &ModelSpec,
        image: Bytes,
    ) -> std::result::Result<Vec<f32>, BackendError> {
        let url = format!("{}:predict", self.version_url(model));
        let image_b64 = URL_SAFE.encode(&image);
        trace!(model = %model.name, image_len = image.len(), b64_len = image_b64.len(), "predict");

        let body = PredictRequest {
            instances: vec![HashMap::from([(model.input_name.as_str(), image_b64)])],
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport_error(model, e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(model, response.status()));
        }

        let parsed: PredictResponse = response
            .json()
            .await
            .map_err(|e| BackendError::failure(format!("error decoding response body: {}", e)))?;

        Ok(parsed.predictions.into_iter().next().unwrap_or_default())
    }

    async fn model_status(
        &self,
        model: &ModelSpec,
    ) -> std::result::Result<ModelStatus, BackendError> {
        let url = self.version_url(model);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error(model, e))?;

        if !response.status().is_success() {
            return Ok(ModelStatus::Unavailable(format!(
                "status code {} from {}",
                response.status(),
                url
            )));
        }

        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| BackendError::failure(format!("Invalid status response: {}", e)))?;

        let Some(version) = parsed.model_version_status.first() else {
            return Ok(ModelStatus::Unavailable(format!(
                "no version status reported for model {} version {}",
                model.name, model.version
            )));
        };

        debug!(
            model = %model.name,
            state = %version.state,
            code = %version.status.error_code,
            "model status"
        );
        if version.status.error_code == "OK" {
            Ok(ModelStatus::Available)
        } else {
            Ok(ModelStatus::Unavailable(format!(
                "{}: {}",
                version.status.error_code, version.status.error_message
            )))
        }
    }

    fn name(&self) -> &'static str {
        "tf_serving"
    }
}
