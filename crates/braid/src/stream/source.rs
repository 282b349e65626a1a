use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use super::Controller;
use crate::error::{Result, StreamError};

/// The producer behind a [`PullStream`](super::PullStream).
///
/// `pull` is called when the consumer reads from an empty buffer. It should
/// enqueue while [`Controller::has_demand`] holds, re-checking after every
/// enqueue, and may close or error the stream. Returning `Err` errors the
/// stream with that error.
#[async_trait::async_trait]
pub trait PullSource<T: Send + 'static>: Send + 'static {
    /// Called once, before the first pull.
    async fn start(&mut self, _controller: &Controller<T>) -> Result<()> {
        Ok(())
    }

    async fn pull(&mut self, controller: &Controller<T>) -> Result<()>;

    /// Called at most once, when the consumer cancels a live stream.
    async fn cancel(&mut self, _reason: Option<String>) -> Result<()> {
        Ok(())
    }
}

pub(super) struct IterSource<I> {
    items: I,
}

impl<I> IterSource<I> {
    pub(super) fn new(items: I) -> Self {
        Self { items }
    }
}

#[async_trait::async_trait]
impl<T, I> PullSource<T> for IterSource<I>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send + 'static,
{
    async fn pull(&mut self, controller: &Controller<T>) -> Result<()> {
        while controller.has_demand() {
            match self.items.next() {
                Some(item) => controller.enqueue(item)?,
                None => return controller.close(),
            }
        }
        Ok(())
    }
}

pub(super) struct StreamSource<T> {
    stream: BoxStream<'static, Result<T>>,
}

impl<T> StreamSource<T> {
    pub(super) fn new(stream: BoxStream<'static, Result<T>>) -> Self {
        Self { stream }
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> PullSource<T> for StreamSource<T> {
    async fn pull(&mut self, controller: &Controller<T>) -> Result<()> {
        while controller.has_demand() {
            match self.stream.next().await {
                Some(Ok(item)) => controller.enqueue(item)?,
                Some(Err(e)) => return Err(e),
                None => return controller.close(),
            }
        }
        Ok(())
    }
}

pub(super) struct OnceSource<T> {
    future: Option<BoxFuture<'static, Result<T>>>,
}

impl<T> OnceSource<T> {
    pub(super) fn new(future: BoxFuture<'static, Result<T>>) -> Self {
        Self {
            future: Some(future),
        }
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> PullSource<T> for OnceSource<T> {
    async fn pull(&mut self, controller: &Controller<T>) -> Result<()> {
        match self.future.take() {
            Some(future) => {
                controller.enqueue(future.await?)?;
                controller.close()
            }
            None => controller.close(),
        }
    }

    async fn cancel(&mut self, _reason: Option<String>) -> Result<()> {
        self.future = None;
        Ok(())
    }
}

pub(super) struct FailedSource {
    error: Option<StreamError>,
}

impl FailedSource {
    pub(super) fn new(error: StreamError) -> Self {
        Self { error: Some(error) }
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> PullSource<T> for FailedSource {
    async fn start(&mut self, _controller: &Controller<T>) -> Result<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn pull(&mut self, controller: &Controller<T>) -> Result<()> {
        controller.close()
    }
}
