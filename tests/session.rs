mod common;

use common::{request, session_context, wait_for, FakeBackend};
use embedstream_core::{ErrorKind, PredictionRequest, SessionEnd, StreamSession};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

#[tokio::test]
async fn test_burst_pauses_reads_at_ceiling() {
    let (backend, gate) = FakeBackend::new().gated();
    let backend = Arc::new(backend);
    let (_gateway, ctx) = session_context(Arc::clone(&backend), 4);

    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulled);
    let burst = futures::stream::iter((0..40).map(|id| Ok(request(id, "m", 1))))
        .inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let session = StreamSession::open(ctx.clone(), None);
    let (outbound, handle) = session.start(burst);

    // Four requests are in flight and the loop stops reading
    assert!(wait_for(Duration::from_secs(2), || backend.running() == 4).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pulled.load(Ordering::SeqCst), 4);
    assert_eq!(ctx.registry.total_in_flight(), 4);

    gate.add_permits(1000);
    let responses: Vec<_> = outbound.map(|r| r.unwrap()).collect().await;
    assert_eq!(responses.len(), 40);

    let summary = handle.await.unwrap();
    assert_eq!(summary.end, SessionEnd::ClientClosed);
    assert_eq!(summary.accepted, 40);
    assert!(summary.peak_in_flight <= 4, "peak was {}", summary.peak_in_flight);
    assert_eq!(pulled.load(Ordering::SeqCst), 40);
}

#[tokio::test]
async fn test_every_request_answered_once() {
    let backend = Arc::new(FakeBackend::new());
    let (_gateway, ctx) = session_context(backend, 8);

    let requests: Vec<Result<PredictionRequest, Status>> =
        (0..200).map(|id| Ok(request(id, "m", (id % 7) as u8))).collect();
    let session = StreamSession::open(ctx, None);
    let (outbound, handle) = session.start(futures::stream::iter(requests));

    let responses: Vec<_> = outbound.map(|r| r.unwrap()).collect().await;
    let ids: HashSet<i64> = responses.iter().map(|r| r.id).collect();
    assert_eq!(responses.len(), 200);
    assert_eq!(ids.len(), 200);
    for response in &responses {
        assert_eq!(response.vector, vec![(response.id % 7) as f32]);
    }
    assert_eq!(handle.await.unwrap().responses, 200);
}

#[tokio::test]
async fn test_client_close_leaves_nothing_registered() {
    let (backend, gate) = FakeBackend::new().gated();
    let backend = Arc::new(backend);
    let (gateway, ctx) = session_context(Arc::clone(&backend), 16);

    let (tx, rx) = mpsc::channel(8);
    let session = StreamSession::open(ctx.clone(), None);
    let session_id = session.id();
    let (outbound, handle) = session.start(ReceiverStream::new(rx));

    for id in 0..5 {
        tx.send(Ok(request(id, "m", 2))).await.unwrap();
    }
    assert!(wait_for(Duration::from_secs(2), || ctx.registry.total_in_flight() == 5).await);
    assert!(ctx.registry.get(session_id).is_some());

    // Close the send side, then let the backend finish
    drop(tx);
    gate.add_permits(100);

    let responses: Vec<_> = outbound.map(|r| r.unwrap()).collect().await;
    assert_eq!(responses.len(), 5);

    let summary = handle.await.unwrap();
    assert_eq!(summary.end, SessionEnd::ClientClosed);
    assert!(ctx.registry.is_empty());
    assert_eq!(backend.running(), 0);
    assert!(gateway
        .dispatcher()
        .queue_depths()
        .iter()
        .all(|lane| lane.depth == 0));
}

#[tokio::test]
async fn test_client_disconnect_cancels_in_flight() {
    let (backend, _gate) = FakeBackend::new().gated();
    let backend = Arc::new(backend);
    let (_gateway, ctx) = session_context(Arc::clone(&backend), 16);

    let (tx, rx) = mpsc::channel(8);
    let session = StreamSession::open(ctx.clone(), None);
    let (outbound, handle) = session.start(ReceiverStream::new(rx));

    tx.send(Ok(request(0, "m", 1))).await.unwrap();
    tx.send(Ok(request(1, "m", 1))).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || backend.running() == 2).await);

    // Transport drops the response stream
    drop(outbound);

    let summary = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("session must end after disconnect")
        .unwrap();
    assert_eq!(summary.end, SessionEnd::TransportFault);
    assert_eq!(summary.responses, 0);
    assert!(wait_for(Duration::from_secs(1), || backend.running() == 0).await);
    assert!(ctx.registry.is_empty());
    assert_eq!(ctx.metrics.snapshot().sessions_closed, 1);
}

#[tokio::test]
async fn test_unknown_model_does_not_affect_others() {
    let backend = Arc::new(FakeBackend::new());
    let (_gateway, ctx) = session_context(backend, 4);

    let requests = vec![
        Ok(request(10, "m", 3)),
        Ok(request(11, "unknown-model", 3)),
        Ok(request(12, "m", 4)),
    ];
    let session = StreamSession::open(ctx, None);
    let (outbound, _handle) = session.start(futures::stream::iter(requests));

    let mut responses: Vec<_> = outbound.map(|r| r.unwrap()).collect().await;
    responses.sort_by_key(|r| r.id);

    assert_eq!(responses[0].vector, vec![3.0]);
    assert_eq!(responses[1].error_kind(), Some(ErrorKind::ModelNotFound));
    assert!(responses[1].vector.is_empty());
    assert_eq!(responses[2].vector, vec![4.0]);
}
