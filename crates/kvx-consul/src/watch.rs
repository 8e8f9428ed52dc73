use std::sync::Arc;

use kvx_core::{KvPair, StoreError, WatchSink};
use tracing::{debug, instrument, warn};

use crate::client::{ConsulClient, KvEntry, KvQuery};

/// Tracks the `X-Consul-Index` of a blocking query loop.
#[derive(Debug, Default)]
pub(crate) struct IndexTracker {
    last: Option<u64>,
}

impl IndexTracker {
    /// Index to block on, `None` before the first response.
    pub(crate) fn query_index(&self) -> Option<u64> {
        self.last
    }

    /// Record a response index and report whether it may carry a change.
    ///
    /// The first response always counts. An index going backwards (agent
    /// restart, snapshot restore) counts as a change and restarts tracking.
    pub(crate) fn observe(&mut self, index: u64) -> bool {
        let changed = match self.last {
            None => true,
            Some(last) if index < last => {
                debug!("Consul index went backwards ({} -> {}), resetting", last, index);
                true
            }
            Some(last) => index > last,
        };
        self.last = Some(index.max(1));
        changed
    }
}

/// Pairs under `prefix`, the directory marker itself excluded.
pub(crate) fn tree_pairs(prefix: &str, entries: Vec<KvEntry>) -> Result<Vec<KvPair>, StoreError> {
    entries
        .into_iter()
        .filter(|entry| entry.key != prefix)
        .map(|entry| entry.into_pair().map_err(StoreError::from))
        .collect()
}

fn key_pair(entries: Vec<KvEntry>) -> Result<Option<KvPair>, StoreError> {
    entries
        .into_iter()
        .next()
        .map(|entry| entry.into_pair().map_err(StoreError::from))
        .transpose()
}

/// Blocking-query loop feeding a watcher.
///
/// Emits the current state first, then once per index advance whose decoded
/// state differs from the last emitted one.
async fn poll<T, F>(
    client: Arc<ConsulClient>,
    key: String,
    recurse: bool,
    sink: WatchSink<T>,
    project: F,
) where
    T: Clone + PartialEq,
    F: Fn(Vec<KvEntry>) -> Result<T, StoreError>,
{
    let mut tracker = IndexTracker::default();
    let mut last: Option<T> = None;

    loop {
        let query = KvQuery {
            recurse,
            index: tracker.query_index(),
        };
        let response = match client.kv_get(&key, query).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Watch on {} failed: {}", key, e);
                sink.failed(e).await;
                return;
            }
        };

        if !tracker.observe(response.index) {
            continue;
        }

        let current = match project(response.entries) {
            Ok(current) => current,
            Err(e) => {
                warn!("Watch on {} received undecodable data: {}", key, e);
                sink.failed(e).await;
                return;
            }
        };

        if last.as_ref() == Some(&current) {
            debug!("Index of {} advanced to {} without change", key, response.index);
            continue;
        }

        last = Some(current.clone());
        if !sink.changed(current).await {
            debug!("Watch on {} ended by consumer", key);
            return;
        }
    }
}

/// Watch a single key.
#[instrument(skip(client, sink), level = "debug")]
pub(crate) async fn watch_key(
    client: Arc<ConsulClient>,
    key: String,
    sink: WatchSink<Option<KvPair>>,
) {
    poll(client, key, false, sink, key_pair).await
}

/// Watch every key under `prefix`.
#[instrument(skip(client, sink), level = "debug")]
pub(crate) async fn watch_tree(
    client: Arc<ConsulClient>,
    prefix: String,
    sink: WatchSink<Vec<KvPair>>,
) {
    let marker = prefix.clone();
    poll(client, prefix, true, sink, move |entries| {
        tree_pairs(&marker, entries)
    })
    .await
}
