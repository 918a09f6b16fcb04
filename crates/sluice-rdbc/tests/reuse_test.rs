//! Tests for reference-counted sharing of databases

mod common;

use async_trait::async_trait;
use common::{mock_source, Backend};
use sluice_rdbc::prelude::*;
use sluice_rdbc::reuse::{open_db_in, Resource};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Counted {
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Resource for Counted {
    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Loader building a resource that reports its close into `closes`
fn loader(closes: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<Result<Counted>> {
    let closes = closes.clone();
    move || std::future::ready(Ok(Counted { closes }))
}

#[tokio::test]
async fn test_get_twice_shares_one_resource() {
    let map = Arc::new(ResourceMap::new());
    let closes = Arc::new(AtomicUsize::new(0));
    let built = Arc::new(AtomicUsize::new(0));

    let load = || {
        built.fetch_add(1, Ordering::SeqCst);
        loader(&closes)()
    };
    let a = map.get("k", load).await.unwrap();
    let b = map.get("k", load).await.unwrap();

    assert!(Arc::ptr_eq(a.resource(), b.resource()));
    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert_eq!(map.use_count("k"), 2);

    map.release("k").await.unwrap();
    assert_eq!(map.use_count("k"), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 0);

    map.release("k").await.unwrap();
    assert_eq!(map.use_count("k"), 0);
    assert!(map.is_empty());
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // a third release is a no-op
    map.release("k").await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    drop((a, b));
}

#[tokio::test]
async fn test_shared_release_counts_once() {
    let map = Arc::new(ResourceMap::new());
    let closes = Arc::new(AtomicUsize::new(0));

    let a = map.get("k", loader(&closes)).await.unwrap();
    let b = map.get("k", loader(&closes)).await.unwrap();
    assert_eq!(a.key(), "k");

    a.release().await.unwrap();
    a.release().await.unwrap();
    assert_eq!(map.use_count("k"), 1);

    b.release().await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(map.is_empty());
}

#[tokio::test]
async fn test_failed_build_leaves_map_untouched() {
    let map: Arc<ResourceMap<Counted>> = Arc::new(ResourceMap::new());
    let err = map
        .get("k", || async { Err(Error::connection("refused")) })
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Connection { .. }));
    assert!(map.is_empty());
}

#[tokio::test]
async fn test_dropped_handle_releases_in_background() {
    let map = Arc::new(ResourceMap::new());
    let closes = Arc::new(AtomicUsize::new(0));

    let handle = map.get("k", loader(&closes)).await.unwrap();
    drop(handle);
    for _ in 0..10 {
        if map.is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(map.is_empty());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reset_closes_everything() {
    let map = Arc::new(ResourceMap::new());
    let closes = Arc::new(AtomicUsize::new(0));

    let a = map.get("a", loader(&closes)).await.unwrap();
    let b = map.get("b", loader(&closes)).await.unwrap();
    assert_eq!(map.len(), 2);

    map.reset().await.unwrap();
    assert!(map.is_empty());
    assert_eq!(closes.load(Ordering::SeqCst), 2);

    // releasing after a reset finds nothing to close
    a.release().await.unwrap();
    b.release().await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_open_db_shares_pool_per_source_key() {
    let map = Arc::new(ResourceMap::new());
    let backend = Backend::new();

    let first = open_db_in(&map, mock_source("mock://db1/etl", &backend)).await.unwrap();
    let second = open_db_in(&map, mock_source("mock://db1/etl", &backend)).await.unwrap();
    let other = open_db_in(&map, mock_source("mock://db2/etl", &backend)).await.unwrap();

    assert!(Arc::ptr_eq(first.resource(), second.resource()));
    assert!(!Arc::ptr_eq(first.resource(), other.resource()));
    assert_eq!(map.use_count(first.key()), 2);
    assert_eq!(map.len(), 2);

    first.release().await.unwrap();
    second.release().await.unwrap();
    other.release().await.unwrap();
    assert!(map.is_empty());

    let err = first.ping().await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
}

#[tokio::test]
async fn test_handle_from_before_reset_leaves_new_slot_alone() {
    let map = Arc::new(ResourceMap::new());
    let closes = Arc::new(AtomicUsize::new(0));

    let stale = map.get("k", loader(&closes)).await.unwrap();
    map.reset().await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    let fresh = map.get("k", loader(&closes)).await.unwrap();
    stale.release().await.unwrap();
    assert_eq!(map.use_count("k"), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    fresh.release().await.unwrap();
    assert!(map.is_empty());
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dropped_stale_handle_leaves_new_slot_alone() {
    let map = Arc::new(ResourceMap::new());
    let closes = Arc::new(AtomicUsize::new(0));

    let stale = map.get("k", loader(&closes)).await.unwrap();
    map.reset().await.unwrap();
    let fresh = map.get("k", loader(&closes)).await.unwrap();

    drop(stale);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(map.use_count("k"), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    drop(fresh);
}
