use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::StoreError;
use crate::store::KvPair;

/// Events buffered between the poll task and the consumer.
const EVENT_BUFFER: usize = 16;

/// Event delivered by a [`Watcher`].
#[derive(Debug)]
pub enum WatchEvent<T> {
    /// Current state after the backend index advanced.
    Changed(T),
    /// The long-poll failed. No event follows a failure.
    Failed(StoreError),
}

impl<T> WatchEvent<T> {
    /// Convert into a `Result`, useful with `?` in consumer loops.
    pub fn into_result(self) -> Result<T, StoreError> {
        match self {
            WatchEvent::Changed(value) => Ok(value),
            WatchEvent::Failed(err) => Err(err),
        }
    }
}

/// Events of a single-key watch: `None` when the key is absent.
pub type KeyEvent = WatchEvent<Option<KvPair>>;

/// Events of a subtree watch: pairs under the directory, marker excluded.
pub type TreeEvent = WatchEvent<Vec<KvPair>>;

/// Lifecycle of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Streaming,
    Ended,
}

/// Producer side handed to a backend poll loop.
pub struct WatchSink<T> {
    tx: mpsc::Sender<WatchEvent<T>>,
}

impl<T> WatchSink<T> {
    /// Deliver a change. Returns `false` once the consumer has gone away,
    /// in which case the poll loop must stop.
    pub async fn changed(&self, value: T) -> bool {
        self.tx.send(WatchEvent::Changed(value)).await.is_ok()
    }

    /// Deliver a terminal failure.
    pub async fn failed(self, err: StoreError) {
        let _ = self.tx.send(WatchEvent::Failed(err)).await;
    }

    /// Whether the consumer ended the watch.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A cancelable stream of change events bound to one key or subtree.
///
/// The backend poll loop runs on its own task. [`Watcher::end`] aborts it and
/// discards anything already buffered, so nothing is observed after `end()`.
/// Dropping the watcher has the same effect.
pub struct Watcher<T> {
    events: ReceiverStream<WatchEvent<T>>,
    task: Option<JoinHandle<()>>,
    state: WatchState,
}

impl<T: Send + 'static> Watcher<T> {
    /// Start streaming: spawn `poll` on the current Tokio runtime.
    pub fn spawn<F, Fut>(poll: F) -> Self
    where
        F: FnOnce(WatchSink<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(poll(WatchSink { tx }));
        Self {
            events: ReceiverStream::new(rx),
            task: Some(task),
            state: WatchState::Streaming,
        }
    }
}

impl<T> Watcher<T> {
    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Cancel the outstanding poll and stop delivery.
    pub fn end(&mut self) {
        if self.state == WatchState::Ended {
            return;
        }
        self.state = WatchState::Ended;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events.close();
        let mut dropped = 0usize;
        while self.events.as_mut().try_recv().is_ok() {
            dropped += 1;
        }
        debug!(dropped, "watch ended");
    }
}

impl<T> Stream for Watcher<T> {
    type Item = WatchEvent<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.state == WatchState::Ended {
            return Poll::Ready(None);
        }
        Pin::new(&mut this.events).poll_next(cx)
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
