//! Async FIFO queue fanning many producer tasks into one consumer loop.
//!
//! Producers share the queue through an `Arc` and push concurrently; the
//! consumer pulls in insertion order. [`BlockingQueue::finish`] enqueues the
//! done marker, which the consumer observes after the remaining items.
//!
//! The buffer itself is unbounded. A producer that awaits the [`Dequeued`]
//! handle returned by `push` before producing again keeps at most one item
//! in flight, so it advances only as fast as the consumer pulls.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::{Result, StreamError};

enum Slot<T> {
    Item(T, oneshot::Sender<()>),
    Done,
}

/// Resolves once the pushed item has left the queue.
///
/// Also resolves if the queue is dropped with the item still buffered.
#[derive(Debug)]
pub struct Dequeued {
    rx: oneshot::Receiver<()>,
}

impl Future for Dequeued {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

/// Outcome of a non-blocking pull.
#[derive(Debug, PartialEq, Eq)]
pub enum TryPull<T> {
    Item(T),
    Empty,
    Done,
}

pub struct BlockingQueue<T> {
    tx: mpsc::UnboundedSender<Slot<T>>,
    rx: Mutex<mpsc::UnboundedReceiver<Slot<T>>>,
    finished: AtomicBool,
    drained: AtomicBool,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            finished: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }
    }

    /// Appends an item, resuming a suspended `pull` if there is one.
    ///
    /// The returned handle completes when `pull` or `try_pull` takes the item.
    pub fn push(&self, item: T) -> Result<Dequeued> {
        if self.finished.load(Ordering::Acquire) {
            return Err(StreamError::QueueFinished);
        }
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Slot::Item(item, ack))
            .map_err(|_| StreamError::QueueFinished)?;
        Ok(Dequeued { rx })
    }

    /// Enqueues the done marker. Later calls are ignored.
    pub fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Slot::Done);
        }
    }

    /// Next item in insertion order; `None` once the done marker is reached.
    pub async fn pull(&self) -> Option<T> {
        if self.drained.load(Ordering::Acquire) {
            return None;
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Slot::Item(item, ack)) => {
                let _ = ack.send(());
                Some(item)
            }
            Some(Slot::Done) | None => {
                self.drained.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Takes the next item without waiting.
    pub fn try_pull(&self) -> TryPull<T> {
        if self.drained.load(Ordering::Acquire) {
            return TryPull::Done;
        }
        let Ok(mut rx) = self.rx.try_lock() else {
            return TryPull::Empty;
        };
        match rx.try_recv() {
            Ok(Slot::Item(item, ack)) => {
                let _ = ack.send(());
                TryPull::Item(item)
            }
            Ok(Slot::Done) | Err(mpsc::error::TryRecvError::Disconnected) => {
                self.drained.store(true, Ordering::Release);
                TryPull::Done
            }
            Err(mpsc::error::TryRecvError::Empty) => TryPull::Empty,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingQueue")
            .field("finished", &self.is_finished())
            .field("drained", &self.drained.load(Ordering::Acquire))
            .finish()
    }
}
