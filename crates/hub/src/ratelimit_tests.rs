// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn bucket_allows_burst_then_blocks() {
    let mut bucket = TokenBucket::new(1.0, 3.0);
    assert!(bucket.allow());
    assert!(bucket.allow());
    assert!(bucket.allow());
    // Burst exhausted; no meaningful time has passed to refill.
    assert!(!bucket.allow());
}

#[test]
fn bucket_refills_over_time() {
    let mut bucket = TokenBucket::new(1000.0, 1.0);
    assert!(bucket.allow());
    assert!(!bucket.allow());
    std::thread::sleep(std::time::Duration::from_millis(5));
    // 1000/s refill: 5ms is plenty for one token.
    assert!(bucket.allow());
}

#[test]
fn bucket_never_exceeds_burst() {
    let mut bucket = TokenBucket::new(1000.0, 2.0);
    std::thread::sleep(std::time::Duration::from_millis(10));
    assert!(bucket.allow());
    assert!(bucket.allow());
    assert!(!bucket.allow());
}

#[tokio::test]
async fn keyed_buckets_are_independent() {
    let buckets = Buckets::new(1.0, 1.0);
    assert!(buckets.allow("alice").await);
    assert!(!buckets.allow("alice").await);
    // A different key gets its own bucket.
    assert!(buckets.allow("bob").await);
    assert_eq!(buckets.len().await, 2);
}

#[tokio::test]
async fn sweep_drops_idle_buckets_only() {
    let buckets = Buckets::new(1.0, 1.0);
    buckets.allow("stale").await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    buckets.allow("fresh").await;

    let dropped = buckets.sweep(std::time::Duration::from_millis(10)).await;
    assert_eq!(dropped, 1);
    assert_eq!(buckets.len().await, 1);
}
