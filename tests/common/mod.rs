//! Common test utilities for the embedstream gateway

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use embedstream_core::{
    codec::ImagePredictionClient,
    metrics::GatewayMetrics,
    registry::SessionRegistry,
    BackendError, Gateway, GatewaySettings, InferenceBackend, ModelCatalog, ModelSpec,
    PredictionRequest, SessionContext,
};
use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

/// Deterministic backend.
///
/// The first image byte selects the outcome from `outcomes`; unknown bytes
/// echo `[byte as f32]`. Every call waits on `gate` when one is set.
#[derive(Default)]
pub struct FakeBackend {
    outcomes: HashMap<u8, Result<Vec<f32>, BackendError>>,
    gate: Option<Arc<Semaphore>>,
    pub calls: AtomicUsize,
    pub running: Arc<AtomicUsize>,
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, key: u8, outcome: Result<Vec<f32>, BackendError>) -> Self {
        self.outcomes.insert(key, outcome);
        self
    }

    /// Blocks every call until permits are added to the returned semaphore.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    async fn infer(&self, _model: &ModelSpec, image: Bytes) -> Result<Vec<f32>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_add(1, Ordering::SeqCst);
        let _running = RunningGuard(Arc::clone(&self.running));

        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| BackendError::failure(e.to_string()))?;
        }

        let key = image.first().copied().unwrap_or_default();
        match self.outcomes.get(&key) {
            Some(outcome) => outcome.clone(),
            None => Ok(vec![key as f32]),
        }
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Catalog with the single model `"m"`
pub fn catalog() -> ModelCatalog {
    ModelCatalog::from_specs(vec![ModelSpec::new("m").with_workers(4)]).unwrap()
}

pub fn settings(max_in_flight: usize) -> GatewaySettings {
    let mut settings = GatewaySettings {
        default_queue_capacity: 64,
        default_workers: 4,
        shutdown_grace: Duration::from_secs(5),
        metrics_interval: None,
        ..GatewaySettings::default()
    };
    settings.session.max_in_flight = max_in_flight;
    settings
}

/// Session context over a fresh gateway, for driving sessions without a transport
pub fn session_context(
    backend: Arc<FakeBackend>,
    max_in_flight: usize,
) -> (Gateway, SessionContext) {
    let gateway = Gateway::new(catalog(), backend, settings(max_in_flight)).unwrap();
    let ctx = gateway.session_context();
    (gateway, ctx)
}

pub fn request(id: i64, model: &str, key: u8) -> PredictionRequest {
    PredictionRequest::new(id, model, vec![key, 0xAA, 0xBB])
}

pub struct TestServer {
    pub handle: tokio::task::JoinHandle<embedstream_core::Result<()>>,
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<GatewayMetrics>,
    pub shutdown: CancellationToken,
}

impl TestServer {
    pub async fn client(&self) -> Result<ImagePredictionClient<Channel>, Box<dyn Error>> {
        Ok(ImagePredictionClient::connect(format!("http://{}", self.addr)).await?)
    }

    /// Signals shutdown and waits for the server to stop
    pub async fn stop(self) -> embedstream_core::Result<()> {
        self.shutdown.cancel();
        self.handle
            .await
            .map_err(|e| embedstream_core::Error::Internal(e.to_string()))?
    }
}

pub async fn start_test_server(
    backend: Arc<FakeBackend>,
    settings: GatewaySettings,
) -> Result<TestServer, Box<dyn Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let gateway = Gateway::new(catalog(), backend, settings)?;
    let registry = Arc::clone(gateway.registry());
    let metrics = Arc::clone(gateway.metrics());
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    let handle = tokio::spawn(async move {
        gateway
            .serve_with_incoming(TcpListenerStream::new(listener), async move {
                signal.cancelled().await
            })
            .await
    });

    Ok(TestServer {
        handle,
        addr,
        registry,
        metrics,
        shutdown,
    })
}

/// Polls `condition` until it holds or `timeout` elapses
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
