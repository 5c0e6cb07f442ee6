// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Write slot scenarios: exclusion, fairness, timeouts, mismatched release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use sqlease_config::PoolConfig;
use sqlease_core::{DetachedHolder, ErrorKind, LeaseHolder, SinkEvent};
use sqlease_pool::{WriteConnection, WriteSlotState};
use sqlease_test_utils::{MockEngine, RecordingSink};
use tokio::time::Instant;

fn write_slot(
    acquire_timeout_ms: u64,
) -> (Arc<MockEngine>, Arc<RecordingSink>, WriteConnection<MockEngine>) {
    let engine = Arc::new(MockEngine::new());
    let sink = Arc::new(RecordingSink::new());
    let config = PoolConfig {
        pool_size: 1,
        acquire_timeout_ms,
        destroy_timeout_ms: 100,
    };
    let writer = WriteConnection::new(Arc::clone(&engine), &config, sink.clone());
    (engine, sink, writer)
}

fn detached() -> Arc<dyn LeaseHolder> {
    Arc::new(DetachedHolder)
}

async fn until_leased(writer: &WriteConnection<MockEngine>) {
    while writer.stats().state != WriteSlotState::Leased {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn short_timeout_loses_to_long_write() {
    let (_engine, sink, writer) = write_slot(1);

    let long = tokio::spawn({
        let writer = writer.clone();
        async move {
            writer
                .run_exclusive(detached(), |_lease| {
                    async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Instant::now())
                    }
                    .boxed()
                })
                .await
        }
    });
    until_leased(&writer).await;

    let started = Instant::now();
    let err = writer.lease_connection(detached()).await.unwrap_err();
    let waited = started.elapsed();
    assert_eq!(err.kind(), ErrorKind::LockAcquireTimeout);
    assert!(waited >= Duration::from_millis(1) && waited < Duration::from_millis(50));
    assert!(matches!(
        sink.events().as_slice(),
        [SinkEvent::AcquireTimeout { .. }]
    ));

    let finished = long.await.unwrap().unwrap();
    assert!(finished.duration_since(started) >= Duration::from_millis(49));
    assert_eq!(writer.stats().state, WriteSlotState::Idle);
}

#[tokio::test(start_paused = true)]
async fn writers_run_one_at_a_time_in_arrival_order() {
    let (_engine, _sink, writer) = write_slot(60_000);
    let order = Arc::new(Mutex::new(Vec::new()));
    let inside = Arc::new(AtomicBool::new(false));

    let mut gate = writer.lease_connection(detached()).await.unwrap();
    let mut tasks = Vec::new();
    for i in 0..5 {
        let writer = writer.clone();
        let order = Arc::clone(&order);
        let inside = Arc::clone(&inside);
        tasks.push(tokio::spawn(async move {
            writer
                .run_exclusive(detached(), move |_lease| {
                    async move {
                        assert!(!inside.swap(true, Ordering::SeqCst), "writers overlapped");
                        order.lock().unwrap().push(i);
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        inside.store(false, Ordering::SeqCst);
                        Ok(())
                    }
                    .boxed()
                })
                .await
        }));
        // Let task `i` reach the lock queue before spawning the next one.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    gate.release().await;
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn invalidated_writer_is_reopened() {
    let (engine, _sink, writer) = write_slot(1_000);
    writer.connect().await.unwrap();

    let first = writer
        .run_exclusive(detached(), |lease| {
            async move {
                lease.mark_as_invalid();
                Ok(lease.connection()?.serial())
            }
            .boxed()
        })
        .await
        .unwrap();
    assert_eq!(writer.stats().state, WriteSlotState::Absent);

    let second = writer
        .run_exclusive(detached(), |lease| {
            async move { Ok(lease.connection()?.serial()) }.boxed()
        })
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(engine.destroyed_serials(), vec![first]);
}

#[tokio::test]
async fn lease_from_another_writer_is_reported_not_released() {
    let (_engine, sink, writer) = write_slot(1_000);
    let (_other_engine, _other_sink, other) = write_slot(1_000);
    let mut foreign = other.lease_connection(detached()).await.unwrap();

    writer.release_connection(&mut foreign).await;

    assert!(!foreign.is_released());
    assert_eq!(sink.invariant_violations(), 1);
    assert_eq!(other.stats().active_lease, Some(foreign.id()));
    other.release_connection(&mut foreign).await;
    assert_eq!(other.stats().active_lease, None);
}

#[tokio::test(start_paused = true)]
async fn lock_is_released_only_after_cleanup() {
    let (engine, _sink, writer) = write_slot(60_000);
    let mut first = writer.lease_connection(detached()).await.unwrap();
    first.mark_as_invalid();

    let next = tokio::spawn({
        let writer = writer.clone();
        async move {
            let lease = writer.lease_connection(detached()).await?;
            Ok::<_, sqlease_core::SqleaseError>(lease.connection()?.serial())
        }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    first.release().await;
    let serial = next.await.unwrap().unwrap();
    assert_eq!(serial, 2);
    assert_eq!(engine.destroyed(), 1);
}
