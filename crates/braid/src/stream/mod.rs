//! Pull-driven streams with consumer-advertised demand.
//!
//! A [`PullStream`] wraps a [`PullSource`]. Values flow through a bounded
//! buffer owned by the stream; the producer sees the remaining capacity via
//! [`Controller::desired_size`] and the consumer drains it through a single
//! exclusive [`Reader`].
//!
//! - The source is started lazily on the first read.
//! - A read with an empty buffer triggers one `pull`. Push-driven sources
//!   may return from `pull` without producing anything; the read then waits
//!   for the controller to signal new data.
//! - Closed, errored, and cancelled are terminal. Reads after close or cancel
//!   return `None`, reads after an error return that error.

mod controller;
mod reader;
mod source;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{Mutex, Notify};

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};

pub use controller::Controller;
pub use reader::Reader;
pub use source::PullSource;

use source::{FailedSource, IterSource, OnceSource, StreamSource};

#[derive(Debug, Clone)]
enum Status {
    Readable,
    Closed,
    Cancelled,
    Errored(StreamError),
}

struct State<T> {
    queue: VecDeque<T>,
    status: Status,
    locked: bool,
}

/// Result of taking from the buffer without pulling.
pub(crate) enum Buffered<T> {
    Item(T),
    Empty,
    Done,
    Failed(StreamError),
}

/// Buffer and lifecycle state shared by the stream, its reader, and its controller.
pub(crate) struct Shared<T> {
    state: StdMutex<State<T>>,
    notify: Notify,
    high_water_mark: usize,
}

impl<T> Shared<T> {
    fn new(high_water_mark: usize) -> Self {
        Self {
            state: StdMutex::new(State {
                queue: VecDeque::new(),
                status: Status::Readable,
                locked: false,
            }),
            notify: Notify::new(),
            high_water_mark,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // The state is plain data; a panic mid-update cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn take(&self) -> Buffered<T> {
        let mut state = self.lock();
        if let Status::Errored(ref e) = state.status {
            return Buffered::Failed(e.clone());
        }
        match state.queue.pop_front() {
            Some(item) => Buffered::Item(item),
            None if matches!(state.status, Status::Readable) => Buffered::Empty,
            None => Buffered::Done,
        }
    }

    /// True once a read would not block: data is buffered or the stream is terminal.
    pub(crate) fn has_progress(&self) -> bool {
        let state = self.lock();
        !state.queue.is_empty() || !matches!(state.status, Status::Readable)
    }

    pub(crate) fn is_readable(&self) -> bool {
        matches!(self.lock().status, Status::Readable)
    }

    pub(crate) fn desired_size(&self) -> Option<isize> {
        let state = self.lock();
        match state.status {
            Status::Readable => Some(self.high_water_mark as isize - state.queue.len() as isize),
            Status::Closed | Status::Cancelled => Some(0),
            Status::Errored(_) => None,
        }
    }

    pub(crate) fn enqueue(&self, item: T) -> Result<()> {
        {
            let mut state = self.lock();
            match state.status {
                Status::Readable => state.queue.push_back(item),
                Status::Closed | Status::Cancelled => return Err(StreamError::Closed),
                Status::Errored(_) => return Err(StreamError::Errored),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<()> {
        {
            let mut state = self.lock();
            match state.status {
                Status::Readable => state.status = Status::Closed,
                Status::Closed | Status::Cancelled => return Err(StreamError::Closed),
                Status::Errored(_) => return Err(StreamError::Errored),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Errors the stream unless it is already terminal. Returns whether it took effect.
    pub(crate) fn error(&self, error: StreamError) -> bool {
        {
            let mut state = self.lock();
            if !matches!(state.status, Status::Readable) {
                return false;
            }
            tracing::debug!(error = %error, "Stream errored");
            state.queue.clear();
            state.status = Status::Errored(error);
        }
        self.notify.notify_one();
        true
    }

    /// Moves a live stream to cancelled, discarding buffered items.
    /// Returns false when the stream was already terminal.
    fn begin_cancel(&self) -> bool {
        let mut state = self.lock();
        if !matches!(state.status, Status::Readable) {
            return false;
        }
        state.queue.clear();
        state.status = Status::Cancelled;
        true
    }

    fn acquire_lock(&self) -> Result<()> {
        let mut state = self.lock();
        if state.locked {
            return Err(StreamError::Locked);
        }
        state.locked = true;
        Ok(())
    }

    fn release_lock(&self) {
        self.lock().locked = false;
    }

    fn is_locked(&self) -> bool {
        self.lock().locked
    }
}

/// Source plus its start flag, serialized behind an async mutex.
pub(crate) struct Driver<T> {
    source: Box<dyn PullSource<T>>,
    started: bool,
}

/// A demand-driven stream of `T`.
pub struct PullStream<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    driver: Arc<Mutex<Driver<T>>>,
}

impl<T: Send + 'static> PullStream<T> {
    pub fn new(source: impl PullSource<T>) -> Self {
        Self::with_config(source, StreamConfig::default())
    }

    pub fn with_config(source: impl PullSource<T>, config: StreamConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config.high_water_mark())),
            driver: Arc::new(Mutex::new(Driver {
                source: Box::new(source),
                started: false,
            })),
        }
    }

    /// Stream over the items of an iterator, pulled lazily.
    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(IterSource::new(items.into_iter()))
    }

    /// Adapts a fallible `futures` stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        let stream: BoxStream<'static, Result<T>> = stream.boxed();
        Self::new(StreamSource::new(stream))
    }

    /// Single-element stream resolving a deferred value on first read.
    pub fn once<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let future: BoxFuture<'static, Result<T>> = future.boxed();
        Self::new(OnceSource::new(future))
    }

    pub fn empty() -> Self {
        Self::iter(std::iter::empty())
    }

    /// Stream that errors with `error` on first read.
    pub fn failed(error: StreamError) -> Self {
        Self::new(FailedSource::new(error))
    }

    /// Acquires the exclusive reader. Fails with [`StreamError::Locked`] while
    /// another reader is live.
    pub fn get_reader(&self) -> Result<Reader<T>> {
        self.shared.acquire_lock()?;
        Ok(Reader::new(Arc::clone(&self.shared), Arc::clone(&self.driver)))
    }

    pub fn into_reader(self) -> Result<Reader<T>> {
        self.get_reader()
    }

    pub fn is_locked(&self) -> bool {
        self.shared.is_locked()
    }

    pub fn high_water_mark(&self) -> usize {
        self.shared.high_water_mark
    }

    /// Cancels a stream nobody is reading. No-op once the stream is terminal.
    pub async fn cancel(&self, reason: Option<String>) -> Result<()> {
        if self.shared.is_locked() {
            return Err(StreamError::Locked);
        }
        cancel_source(&self.shared, &self.driver, reason).await
    }

    /// Producer handle for push-driven sources that register eagerly.
    pub(crate) fn controller(&self) -> Controller<T> {
        Controller::new(Arc::clone(&self.shared))
    }
}

impl<T: Send + 'static> std::fmt::Debug for PullStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullStream")
            .field("high_water_mark", &self.shared.high_water_mark)
            .field("locked", &self.shared.is_locked())
            .finish()
    }
}

async fn cancel_source<T: Send + 'static>(
    shared: &Shared<T>,
    driver: &Mutex<Driver<T>>,
    reason: Option<String>,
) -> Result<()> {
    if !shared.begin_cancel() {
        return Ok(());
    }
    shared.notify.notify_one();
    let mut driver = driver.lock().await;
    driver.source.cancel(reason).await
}
