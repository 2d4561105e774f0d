//! Concurrency tests for the offset watermark
//!
//! These tests verify:
//! 1. Apply calls of one partition never overlap (single critical section)
//! 2. Different partitions are applied in parallel
//! 3. Concurrent redelivery of the same offsets converges on the max offset

use futures::future::join_all;
use offset_watermark::{OffsetWatermark, ProcessingResult};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "rails-to-go";

/// Test: apply functions of one partition are mutually exclusive
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_partition_applies_never_overlap() {
    let watermark = Arc::new(OffsetWatermark::new());
    let in_section = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicU32::new(0));

    let tasks = (0..20i64).map(|offset| {
        let watermark = watermark.clone();
        let in_section = in_section.clone();
        let overlaps = overlaps.clone();
        tokio::spawn(async move {
            watermark
                .process_if_new(TOPIC, 0, offset, || async move {
                    if in_section.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_section.store(false, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
                .await
                .expect("valid offset")
        })
    });

    for result in join_all(tasks).await {
        result.expect("task panicked");
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

/// Test: a slow apply on partition 0 does not block partition 1
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partitions_progress_independently() {
    let watermark = Arc::new(OffsetWatermark::new());

    let slow = {
        let watermark = watermark.clone();
        tokio::spawn(async move {
            watermark
                .process_if_new(TOPIC, 0, 1, || async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<_, String>(())
                })
                .await
        })
    };

    // Give the slow task time to take partition 0's lock
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast = tokio::time::timeout(
        Duration::from_millis(100),
        watermark.process_if_new(TOPIC, 1, 1, || async { Ok::<_, String>(()) }),
    )
    .await
    .expect("partition 1 must not wait for partition 0")
    .expect("valid offset");

    assert_eq!(fast, ProcessingResult::Success(()));
    slow.await.expect("task panicked").expect("valid offset");
}

/// Test: 10 consumers redelivering offsets 0..10 in reverse order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redelivery_converges_on_max_offset() {
    let watermark = Arc::new(OffsetWatermark::new());
    let applied = Arc::new(AtomicU32::new(0));

    let tasks = (0..10).map(|consumer| {
        let watermark = watermark.clone();
        let applied = applied.clone();
        tokio::spawn(async move {
            for offset in (0..10i64).rev() {
                let applied = applied.clone();
                let result = watermark
                    .process_if_new(TOPIC, 2, offset, || async move {
                        applied.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(consumer)
                    })
                    .await
                    .expect("valid offset");
                assert!(result.is_ok());
            }
        })
    });

    for result in join_all(tasks).await {
        result.expect("task panicked");
    }

    assert_eq!(watermark.current(TOPIC, 2).await, Some(9));
    // Every consumer starts at 9, so only the ten deliveries of 9 apply
    assert_eq!(applied.load(Ordering::SeqCst), 10);
}
