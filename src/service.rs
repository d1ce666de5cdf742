//! gRPC service and gateway assembly.
//!
//! [`Gateway`] wires the backend pool, the dispatcher, the session registry
//! and the metrics together and serves the `ImagePrediction` service until a
//! shutdown signal arrives. Each `Predict` call becomes one
//! [`StreamSession`].

use crate::backend::{BackendPool, InferenceBackend};
use crate::catalog::ModelCatalog;
use crate::codec::{ImagePrediction, ImagePredictionServer, PredictionRequest};
use crate::config::ServiceConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::metrics::{spawn_reporter, GatewayMetrics, ReportSources};
use crate::registry::{SessionRegistry, ShutdownReport};
use crate::session::{ResponseStream, SessionContext, SessionSettings, StreamSession};
use futures::Stream;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

/// Gateway-wide settings
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub session: SessionSettings,
    pub default_queue_capacity: usize,
    pub default_workers: usize,
    pub shutdown_grace: Duration,
    /// Reporter period; `None` disables the reporter
    pub metrics_interval: Option<Duration>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        let config = crate::config::DispatcherConfig::default();
        Self {
            session: SessionSettings::default(),
            default_queue_capacity: config.default_queue_capacity,
            default_workers: config.default_workers,
            shutdown_grace: Duration::from_secs(crate::constants::defaults::SHUTDOWN_GRACE_SECS),
            metrics_interval: None,
        }
    }
}

impl From<&ServiceConfig> for GatewaySettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            session: SessionSettings::from(config),
            default_queue_capacity: config.dispatcher.default_queue_capacity,
            default_workers: config.dispatcher.default_workers,
            shutdown_grace: config.shutdown_grace(),
            metrics_interval: config.metrics.enabled.then(|| config.metrics_interval()),
        }
    }
}

/// The `ImagePrediction` service implementation
#[derive(Clone)]
pub struct PredictionService {
    ctx: SessionContext,
}

impl PredictionService {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }
}

#[tonic::async_trait]
impl ImagePrediction for PredictionService {
    type PredictStream = ResponseStream;

    async fn predict(
        &self,
        request: Request<Streaming<PredictionRequest>>,
    ) -> std::result::Result<Response<Self::PredictStream>, Status> {
        if self.ctx.registry.is_shutting_down() {
            return Err(Status::unavailable("server shutting down"));
        }

        let peer = request.remote_addr();
        let session = StreamSession::open(self.ctx.clone(), peer);
        let (outbound, _summary) = session.start(request.into_inner());
        Ok(Response::new(outbound))
    }
}

/// A fully wired gateway
pub struct Gateway {
    pool: Arc<BackendPool>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<GatewayMetrics>,
    settings: GatewaySettings,
}

impl Gateway {
    /// Wires a gateway over `backend`.
    ///
    /// Spawns the dispatcher lanes, so this must run inside a Tokio runtime.
    pub fn new(
        catalog: ModelCatalog,
        backend: Arc<dyn InferenceBackend>,
        settings: GatewaySettings,
    ) -> Result<Self> {
        if catalog.is_empty() {
            return Err(Error::Config("Cannot find any model info in configuration".into()));
        }

        let pool = Arc::new(BackendPool::new(backend, &catalog, settings.default_workers));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&pool),
            &catalog,
            settings.default_queue_capacity,
        ));
        info!(
            backend = pool.backend_name(),
            models = ?catalog.names(),
            max_in_flight = settings.session.max_in_flight,
            "gateway initialized"
        );

        Ok(Self {
            pool,
            dispatcher,
            registry: Arc::new(SessionRegistry::new()),
            metrics: Arc::new(GatewayMetrics::new()),
            settings,
        })
    }

    /// Builds the gateway described by `config`.
    pub fn from_config(config: &ServiceConfig, backend: Arc<dyn InferenceBackend>) -> Result<Self> {
        Self::new(config.catalog()?, backend, GatewaySettings::from(config))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
            settings: self.settings.session,
        }
    }

    pub fn service(&self) -> ImagePredictionServer<PredictionService> {
        ImagePredictionServer::new(PredictionService::new(self.session_context()))
    }

    /// Drains every session within the grace period, then stops the dispatcher.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.registry.shutdown_all(self.settings.shutdown_grace).await;
        if report.forced > 0 {
            warn!("{} session(s) did not drain within the grace period", report.forced);
            // Cancelled sessions still need a moment to unregister
            self.registry
                .wait_empty(self.settings.session.cancel_drain * 2)
                .await;
        }
        self.dispatcher.shutdown();
        info!(
            sessions = report.sessions,
            forced = report.forced,
            "gateway shut down"
        );
        report
    }

    /// Serves on `addr` until `signal` resolves.
    pub async fn serve<F>(self, addr: SocketAddr, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Starting server on {}", listener.local_addr()?);
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        self.serve_with_incoming(incoming, signal).await
    }

    /// Serves connections from `incoming` until `signal` resolves.
    ///
    /// On shutdown the registry is drained before the transport closes,
    /// so sessions can flush their in-flight responses.
    pub async fn serve_with_incoming<I, IO, IE, F>(self, incoming: I, signal: F) -> Result<()>
    where
        I: Stream<Item = std::result::Result<IO, IE>>,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IO::ConnectInfo: Clone + Send + Sync + 'static,
        IE: Into<Box<dyn std::error::Error + Send + Sync>>,
        F: Future<Output = ()> + Send,
    {
        let reporter_shutdown = CancellationToken::new();
        let reporter = self.settings.metrics_interval.map(|interval| {
            let sources = ReportSources {
                metrics: Arc::clone(&self.metrics),
                registry: Arc::clone(&self.registry),
                dispatcher: Arc::clone(&self.dispatcher),
                pool: Arc::clone(&self.pool),
            };
            spawn_reporter(sources, interval, reporter_shutdown.clone())
        });

        let service = self.service();
        let gateway = &self;
        let shutdown = async move {
            signal.await;
            info!("Shutdown signal received");
            gateway.shutdown().await;
        };

        let served = Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await;

        reporter_shutdown.cancel();
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }

        served.map_err(Error::from)
    }
}
