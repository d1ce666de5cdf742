//! Benchmarks for dispatcher submission and session round trips

use async_trait::async_trait;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use embedstream_core::dispatcher::{Completion, Dispatcher, InferenceTask};
use embedstream_core::{
    BackendError, BackendPool, InferenceBackend, ModelCatalog, ModelSpec, PredictionRequest,
    SessionContext, SessionRegistry, SessionSettings, StreamSession,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct ZeroBackend;

#[async_trait]
impl InferenceBackend for ZeroBackend {
    async fn infer(&self, _model: &ModelSpec, _image: Bytes) -> Result<Vec<f32>, BackendError> {
        Ok(vec![0.0; 128])
    }

    fn name(&self) -> &'static str {
        "zero"
    }
}

fn setup(models: usize) -> (ModelCatalog, Arc<BackendPool>) {
    let specs = (0..models).map(|i| ModelSpec::new(format!("model{}", i)).with_workers(8));
    let catalog = ModelCatalog::from_specs(specs).unwrap();
    let pool = Arc::new(BackendPool::new(Arc::new(ZeroBackend), &catalog, 8));
    (catalog, pool)
}

fn bench_submit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatcher_submit");

    for batch in [16usize, 256, 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            let (catalog, pool) = rt.block_on(async { setup(4) });
            let dispatcher = rt.block_on(async { Dispatcher::new(pool, &catalog, batch) });
            let registry = Arc::new(SessionRegistry::new());
            let session = registry.register(None).id();

            b.to_async(&rt).iter(|| async {
                let (tx, mut rx) = mpsc::channel(batch);
                for id in 0..batch as i64 {
                    let model = format!("model{}", id % 4);
                    let request = PredictionRequest::new(id, model, vec![1u8; 64]);
                    dispatcher.submit(InferenceTask::new(
                        session,
                        request,
                        CancellationToken::new(),
                        Completion::new(id, tx.clone(), None),
                    ));
                }
                drop(tx);
                while let Some(finished) = rx.recv().await {
                    black_box(finished.result.ok());
                }
            });
        });
    }
    group.finish();
}

fn bench_session_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("session_round_trip");

    for max_in_flight in [1usize, 16, 64].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(max_in_flight),
            max_in_flight,
            |b, &max_in_flight| {
                let (catalog, pool) = rt.block_on(async { setup(1) });
                let dispatcher =
                    Arc::new(rt.block_on(async { Dispatcher::new(pool, &catalog, 256) }));
                let ctx = SessionContext {
                    dispatcher,
                    registry: Arc::new(SessionRegistry::new()),
                    metrics: Arc::new(embedstream_core::metrics::GatewayMetrics::new()),
                    settings: SessionSettings {
                        max_in_flight,
                        ..SessionSettings::default()
                    },
                };

                b.to_async(&rt).iter(|| async {
                    let requests = (0..256)
                        .map(|id| Ok(PredictionRequest::new(id, "model0", vec![1u8; 64])));
                    let session = StreamSession::open(ctx.clone(), None);
                    let (outbound, _) = session.start(futures::stream::iter(requests));
                    black_box(outbound.count().await)
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_submit, bench_session_round_trip);
criterion_main!(benches);
