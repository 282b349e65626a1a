use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::Mutex;

use super::{Buffered, Controller, Driver, Shared, cancel_source};
use crate::error::Result;

/// Exclusive pull rights over a [`PullStream`](super::PullStream).
///
/// Dropping the reader (or calling [`release`](Reader::release)) unlocks the
/// stream so another reader can be acquired.
pub struct Reader<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    driver: Arc<Mutex<Driver<T>>>,
}

impl<T: Send + 'static> Reader<T> {
    pub(super) fn new(shared: Arc<Shared<T>>, driver: Arc<Mutex<Driver<T>>>) -> Self {
        Self { shared, driver }
    }

    /// Next value, `None` once the stream is closed or cancelled.
    pub async fn read(&mut self) -> Result<Option<T>> {
        loop {
            match self.shared.take() {
                Buffered::Item(item) => return Ok(Some(item)),
                Buffered::Done => return Ok(None),
                Buffered::Failed(e) => return Err(e),
                Buffered::Empty => {}
            }

            if !self.pull().await {
                self.shared.notify.notified().await;
            }
        }
    }

    /// Runs the source once. Returns whether a read can now make progress.
    async fn pull(&mut self) -> bool {
        let mut driver = self.driver.lock().await;
        let controller = Controller::new(Arc::clone(&self.shared));

        if !driver.started {
            driver.started = true;
            if let Err(e) = driver.source.start(&controller).await {
                controller.error(e);
                return true;
            }
        }
        if self.shared.has_progress() {
            return true;
        }

        if let Err(e) = driver.source.pull(&controller).await {
            controller.error(e);
        }
        self.shared.has_progress()
    }

    /// Reads until the stream closes.
    pub async fn read_all(&mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.read().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Cancels the stream, discarding buffered items.
    ///
    /// No-op once the stream is terminal. Returns the source's own cancel
    /// error, if any; the stream is cancelled either way.
    pub async fn cancel(&mut self, reason: Option<String>) -> Result<()> {
        cancel_source(&self.shared, &self.driver, reason).await
    }

    pub fn release(self) {}

    /// Adapts the reader into a `futures` stream that ends after the first error.
    pub fn into_stream(self) -> BoxStream<'static, Result<T>> {
        futures::stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.read().await {
                Ok(Some(item)) => Some((Ok(item), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}

impl<T: Send + 'static> Drop for Reader<T> {
    fn drop(&mut self) {
        self.shared.release_lock();
    }
}

impl<T: Send + 'static> std::fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("desired_size", &self.shared.desired_size())
            .finish()
    }
}
