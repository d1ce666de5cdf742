//! Stream session: one client's bidirectional prediction stream.
//!
//! A session runs two loops that share no unsynchronized state:
//!
//! - the accept loop takes an in-flight permit, then pulls the next inbound
//!   request, validates it and submits it to the dispatcher without waiting;
//! - the write loop drains completions in completion order onto the
//!   outbound stream and releases the permit once the response is written.
//!
//! Because the permit is taken before the read, a session at its ceiling
//! stops consuming inbound messages and transport flow control pushes back
//! on the client.
//!
//! A session ends in one of three ways. When the client closes its send
//! side, every outstanding completion is flushed and the stream closes
//! cleanly. A transport fault cancels all in-flight work and drops its
//! results. A server shutdown stops the accept loop, drains until the
//! registry's grace deadline, and ends the stream with `UNAVAILABLE`.

use crate::codec::{PredictionRequest, VectorResponse};
use crate::config::ServiceConfig;
use crate::constants::defaults;
use crate::dispatcher::{Completion, Dispatcher, Finished, InferenceTask};
use crate::metrics::GatewayMetrics;
use crate::registry::{SessionId, SessionRegistration, SessionRegistry, SessionShared, SessionState};
use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, trace, warn};

/// Outbound half handed to the transport
pub type ResponseStream = ReceiverStream<Result<VectorResponse, Status>>;

/// Per-session limits
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Concurrency ceiling
    pub max_in_flight: usize,
    /// Outbound responses buffered before the write loop waits on the client
    pub response_buffer: usize,
    /// How long `Cancelled` completions are still collected after cancellation
    pub cancel_drain: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_in_flight: defaults::MAX_IN_FLIGHT,
            response_buffer: defaults::RESPONSE_BUFFER,
            cancel_drain: Duration::from_millis(defaults::CANCEL_DRAIN_MILLIS),
        }
    }
}

impl From<&ServiceConfig> for SessionSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            max_in_flight: config.session.max_in_flight.max(1),
            response_buffer: config.server.response_buffer.max(1),
            ..Self::default()
        }
    }
}

/// Shared services every session needs
#[derive(Clone)]
pub struct SessionContext {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<GatewayMetrics>,
    pub settings: SessionSettings,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client closed its send side; all completions were flushed
    ClientClosed,
    /// Inbound read or outbound write failed
    TransportFault,
    /// Server shutdown
    Shutdown,
    /// In-flight work was cancelled externally
    Cancelled,
}

/// Final accounting for a finished session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub end: SessionEnd,
    pub accepted: u64,
    pub responses: u64,
    pub peak_in_flight: usize,
}

/// A registered session, not yet running
pub struct StreamSession {
    registration: SessionRegistration,
    ctx: SessionContext,
}

impl StreamSession {
    /// Registers a new session for `peer`.
    pub fn open(ctx: SessionContext, peer: Option<SocketAddr>) -> Self {
        let registration = ctx.registry.register(peer);
        ctx.metrics.session_opened();
        info!(session = %registration.id(), ?peer, "session opened");
        Self { registration, ctx }
    }

    pub fn id(&self) -> SessionId {
        self.registration.id()
    }

    /// Starts both loops over `inbound`.
    ///
    /// Returns the outbound stream and a handle resolving to the session
    /// summary once the session is closed and unregistered.
    pub fn start<S>(self, inbound: S) -> (ResponseStream, JoinHandle<SessionSummary>)
    where
        S: Stream<Item = Result<PredictionRequest, Status>> + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(self.ctx.settings.response_buffer);
        let handle = tokio::spawn(self.run(inbound, out_tx));
        (ReceiverStream::new(out_rx), handle)
    }

    async fn run<S>(
        self,
        inbound: S,
        out_tx: mpsc::Sender<Result<VectorResponse, Status>>,
    ) -> SessionSummary
    where
        S: Stream<Item = Result<PredictionRequest, Status>> + Send + Unpin + 'static,
    {
        let StreamSession { registration, ctx } = self;
        let id = registration.id();
        let shared = Arc::clone(registration.shared());
        let cancel = registration.cancel_token().clone();
        let settings = ctx.settings;

        let (done_tx, done_rx) = mpsc::channel(settings.max_in_flight);
        let writer = tokio::spawn(write_loop(WriteLoop {
            session: id,
            done_rx,
            out_tx: out_tx.clone(),
            shared: Arc::clone(&shared),
            metrics: Arc::clone(&ctx.metrics),
            cancel: cancel.clone(),
            cancel_drain: settings.cancel_drain,
        }));

        let accept = AcceptLoop {
            session: id,
            permits: Arc::new(Semaphore::new(settings.max_in_flight)),
            done_tx,
            shared: Arc::clone(&shared),
            dispatcher: Arc::clone(&ctx.dispatcher),
            metrics: Arc::clone(&ctx.metrics),
            shutdown: registration.shutdown_token().clone(),
            cancel: cancel.clone(),
        };
        let mut end = accept.run(inbound).await;
        shared.set_state(SessionState::Closing);
        debug!(session = %id, ?end, in_flight = shared.in_flight(), "accept loop finished");

        if end == SessionEnd::TransportFault {
            cancel.cancel();
        }

        let outbound_closed = match writer.await {
            Ok(closed) => closed,
            Err(e) => {
                warn!(session = %id, "write loop failed: {}", e);
                cancel.cancel();
                true
            }
        };
        if outbound_closed {
            end = SessionEnd::TransportFault;
        }

        match end {
            SessionEnd::Shutdown => {
                let _ = out_tx.try_send(Err(Status::unavailable("server shutting down")));
            }
            SessionEnd::Cancelled => {
                let _ = out_tx.try_send(Err(Status::cancelled("session cancelled")));
            }
            SessionEnd::ClientClosed | SessionEnd::TransportFault => {}
        }

        let summary = SessionSummary {
            id,
            end,
            accepted: shared.accepted(),
            responses: shared.responses(),
            peak_in_flight: shared.peak_in_flight(),
        };
        ctx.metrics.session_closed();
        info!(
            session = %id,
            end = ?summary.end,
            accepted = summary.accepted,
            responses = summary.responses,
            peak_in_flight = summary.peak_in_flight,
            "session closed"
        );

        // Unregister before the outbound stream ends
        drop(registration);
        drop(out_tx);
        summary
    }
}

struct AcceptLoop {
    session: SessionId,
    permits: Arc<Semaphore>,
    done_tx: mpsc::Sender<Finished>,
    shared: Arc<SessionShared>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<GatewayMetrics>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
}

impl AcceptLoop {
    async fn run<S>(self, mut inbound: S) -> SessionEnd
    where
        S: Stream<Item = Result<PredictionRequest, Status>> + Unpin,
    {
        loop {
            if self.permits.available_permits() == 0 {
                trace!(session = %self.session, "in-flight ceiling reached, pausing reads");
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return SessionEnd::Cancelled,
                },
            };

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                next = inbound.next() => next,
            };

            let request = match next {
                None => return SessionEnd::ClientClosed,
                Some(Err(status)) => {
                    warn!(session = %self.session, "inbound stream failed: {}", status);
                    return SessionEnd::TransportFault;
                }
                Some(Ok(request)) => request,
            };

            let in_flight = self.shared.request_accepted();
            self.metrics.request_accepted();
            trace!(
                session = %self.session,
                id = request.id,
                model = %request.model,
                in_flight,
                "request accepted"
            );

            let completion = Completion::new(request.id, self.done_tx.clone(), Some(permit));
            if let Err(err) = request.validate() {
                debug!(
                    session = %self.session,
                    id = request.id,
                    "invalid request: {}", err.message
                );
                completion.complete(Err(err));
                continue;
            }

            self.dispatcher.submit(InferenceTask::new(
                self.session,
                request,
                self.cancel.clone(),
                completion,
            ));
        }
    }
}

struct WriteLoop {
    session: SessionId,
    done_rx: mpsc::Receiver<Finished>,
    out_tx: mpsc::Sender<Result<VectorResponse, Status>>,
    shared: Arc<SessionShared>,
    metrics: Arc<GatewayMetrics>,
    cancel: CancellationToken,
    cancel_drain: Duration,
}

/// Writes completions until every completion sender is gone.
///
/// Returns `true` when the outbound stream was closed by the transport.
async fn write_loop(mut w: WriteLoop) -> bool {
    let mut drain_deadline: Option<Instant> = None;
    let mut outbound_closed = false;

    loop {
        let finished = match drain_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, w.done_rx.recv()).await {
                Ok(Some(finished)) => finished,
                Ok(None) | Err(_) => break,
            },
            None => tokio::select! {
                biased;
                finished = w.done_rx.recv() => match finished {
                    Some(finished) => finished,
                    None => break,
                },
                _ = w.cancel.cancelled() => {
                    drain_deadline = Some(Instant::now() + w.cancel_drain);
                    continue;
                }
                _ = w.out_tx.closed() => {
                    debug!(session = %w.session, "outbound stream closed by client");
                    outbound_closed = true;
                    w.cancel.cancel();
                    break;
                }
            },
        };

        let response = VectorResponse::from_result(finished.id, &finished.result);
        let written = if w.cancel.is_cancelled() {
            w.out_tx.try_send(Ok(response)).is_ok()
        } else {
            tokio::select! {
                biased;
                sent = w.out_tx.send(Ok(response)) => sent.is_ok(),
                _ = w.cancel.cancelled() => false,
            }
        };

        if written {
            w.metrics.record_response(&finished.result);
            trace!(
                session = %w.session,
                id = finished.id,
                error = finished.result.is_err(),
                "response written"
            );
        } else {
            w.metrics.response_dropped();
        }
        w.shared.request_finished(written);
        drop(finished.permit);

        if !written && w.out_tx.is_closed() {
            debug!(session = %w.session, "outbound stream closed by client");
            outbound_closed = true;
            w.cancel.cancel();
            break;
        }
    }

    // Completions that arrive from now on are dropped by their senders
    w.done_rx.close();
    while let Ok(finished) = w.done_rx.try_recv() {
        w.metrics.response_dropped();
        w.shared.request_finished(false);
        drop(finished.permit);
    }
    outbound_closed
}
