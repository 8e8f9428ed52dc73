mod common;

use std::time::Duration;

use common::FakeConsul;
use futures::StreamExt;
use kvx_core::{ErrorKind, KvPair, Store, WatchEvent, WatchState, Watcher};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn next_change<T: std::fmt::Debug>(watcher: &mut Watcher<T>) -> T {
    let event = tokio::time::timeout(EVENT_TIMEOUT, watcher.next())
        .await
        .expect("no event before timeout")
        .expect("watch ended unexpectedly");
    match event {
        WatchEvent::Changed(value) => value,
        WatchEvent::Failed(e) => panic!("watch failed: {e}"),
    }
}

fn values(pairs: &[KvPair]) -> Vec<(&str, Option<&str>)> {
    pairs
        .iter()
        .map(|p| (p.key.as_str(), p.value_str()))
        .collect()
}

#[tokio::test]
async fn test_watch_delivers_current_then_changes() {
    let consul = FakeConsul::start().await;
    let store = consul.store();
    store.put("service/leader", b"node-1", None).await.unwrap();

    let mut watcher = store.watch("/service/leader");
    assert_eq!(watcher.state(), WatchState::Streaming);

    let current = next_change(&mut watcher).await.unwrap();
    assert_eq!(current.value_str(), Some("node-1"));

    store.put("service/leader", b"node-2", None).await.unwrap();
    let changed = next_change(&mut watcher).await.unwrap();
    assert_eq!(changed.value_str(), Some("node-2"));
    assert!(changed.version > current.version);

    store.delete("service/leader").await.unwrap();
    assert_eq!(next_change(&mut watcher).await, None);

    watcher.end();
}

#[tokio::test]
async fn test_watch_missing_key_starts_with_none() {
    let consul = FakeConsul::start().await;
    let store = consul.store();

    let mut watcher = store.watch("not/yet");
    assert_eq!(next_change(&mut watcher).await, None);

    store.put("not/yet", b"now", None).await.unwrap();
    let pair = next_change(&mut watcher).await.unwrap();
    assert_eq!(pair.value_str(), Some("now"));
}

#[tokio::test]
async fn test_watch_ignores_unrelated_writes() {
    let consul = FakeConsul::start().await;
    let store = consul.store();
    store.put("watched", b"v", None).await.unwrap();

    let mut watcher = store.watch("watched");
    next_change(&mut watcher).await;

    store.put("elsewhere", b"noise", None).await.unwrap();
    store.put("elsewhere", b"more noise", None).await.unwrap();
    let quiet = tokio::time::timeout(Duration::from_millis(400), watcher.next()).await;
    assert!(quiet.is_err(), "unexpected event: {:?}", quiet);
}

#[tokio::test]
async fn test_watch_tree() {
    let consul = FakeConsul::start().await;
    let store = consul.store();
    store.put("nodes/", b"", None).await.unwrap();
    store.put("nodes/a", b"1", None).await.unwrap();

    let mut watcher = store.watch_tree("nodes");
    let pairs = next_change(&mut watcher).await;
    assert_eq!(values(&pairs), vec![("nodes/a", Some("1"))]);

    store.put("nodes/b", b"2", None).await.unwrap();
    let pairs = next_change(&mut watcher).await;
    assert_eq!(
        values(&pairs),
        vec![("nodes/a", Some("1")), ("nodes/b", Some("2"))]
    );

    store.delete_tree("nodes").await.unwrap();
    assert!(next_change(&mut watcher).await.is_empty());
}

#[tokio::test]
async fn test_watch_tree_on_missing_directory_is_empty() {
    let consul = FakeConsul::start().await;
    let store = consul.store();

    let mut watcher = store.watch_tree("/empty/");
    assert!(next_change(&mut watcher).await.is_empty());
}

#[tokio::test]
async fn test_nothing_observed_after_end() {
    let consul = FakeConsul::start().await;
    let store = consul.store();
    store.put("k", b"v1", None).await.unwrap();

    let mut watcher = store.watch("k");
    next_change(&mut watcher).await;

    store.put("k", b"v2", None).await.unwrap();
    // Give the poll loop time to buffer the change before ending.
    tokio::time::sleep(Duration::from_millis(300)).await;
    watcher.end();
    assert_eq!(watcher.state(), WatchState::Ended);
    assert!(watcher.next().await.is_none());

    store.put("k", b"v3", None).await.unwrap();
    assert!(watcher.next().await.is_none());

    // Ending twice is harmless.
    watcher.end();
}

#[tokio::test]
async fn test_watch_on_closed_store_fails() {
    let consul = FakeConsul::start().await;
    let store = consul.store();
    store.close().await.unwrap();

    let mut watcher = store.watch("k");
    let event = tokio::time::timeout(EVENT_TIMEOUT, watcher.next())
        .await
        .unwrap()
        .unwrap();
    match event {
        WatchEvent::Failed(e) => assert!(e.is(ErrorKind::NotReachable)),
        WatchEvent::Changed(v) => panic!("unexpected change: {v:?}"),
    }
    // No event follows a failure.
    assert!(watcher.next().await.is_none());
}

#[tokio::test]
async fn test_close_fails_running_watch() {
    let consul = FakeConsul::start().await;
    let store = consul.store();

    let mut watcher = store.watch_tree("jobs");
    next_change(&mut watcher).await;

    store.close().await.unwrap();
    let event = tokio::time::timeout(EVENT_TIMEOUT, watcher.next())
        .await
        .unwrap()
        .unwrap();
    assert!(event.into_result().unwrap_err().is(ErrorKind::NotReachable));
}
