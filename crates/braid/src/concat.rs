//! Sequential flattening: drain each inner source to completion, in order.

use std::collections::VecDeque;

use crate::error::{Result, StreamError};
use crate::inner::Inner;
use crate::stream::{Controller, PullSource, PullStream, Reader};

/// Concatenates `streams` in order.
///
/// Fails immediately with a configuration error when `streams` is empty.
pub fn concat<T: Send + 'static>(streams: Vec<PullStream<T>>) -> Result<PullStream<T>> {
    concat_values(streams.into_iter().map(Inner::Stream))
}

/// Concatenates mixed inner sources: streams, readers, plain values,
/// deferred values, and collections.
///
/// Fails immediately with a configuration error when `items` is empty.
pub fn concat_values<T, I>(items: I) -> Result<PullStream<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Inner<T>>,
{
    let pending: VecDeque<Inner<T>> = items.into_iter().collect();
    if pending.is_empty() {
        return Err(StreamError::config("concat requires at least one source"));
    }
    Ok(PullStream::new(ConcatSource::new(Upcoming::Listed(pending))))
}

/// Flattens a stream of inner sources one at a time, in arrival order.
pub fn concat_all<T: Send + 'static>(outer: PullStream<Inner<T>>) -> PullStream<T> {
    PullStream::new(ConcatSource::new(Upcoming::Outer {
        stream: Some(outer),
        reader: None,
    }))
}

enum Upcoming<T: Send + 'static> {
    Listed(VecDeque<Inner<T>>),
    Outer {
        stream: Option<PullStream<Inner<T>>>,
        reader: Option<Reader<Inner<T>>>,
    },
}

struct ConcatSource<T: Send + 'static> {
    upcoming: Upcoming<T>,
    current: Option<Reader<T>>,
    started_sources: usize,
}

impl<T: Send + 'static> ConcatSource<T> {
    fn new(upcoming: Upcoming<T>) -> Self {
        Self {
            upcoming,
            current: None,
            started_sources: 0,
        }
    }

    async fn next_inner(&mut self) -> Result<Option<Inner<T>>> {
        match &mut self.upcoming {
            Upcoming::Listed(pending) => Ok(pending.pop_front()),
            Upcoming::Outer { reader, .. } => {
                let Some(outer) = reader.as_mut() else {
                    return Ok(None);
                };
                let next = outer.read().await?;
                if next.is_none() {
                    *reader = None;
                }
                Ok(next)
            }
        }
    }

    async fn pump(&mut self, controller: &Controller<T>) -> Result<()> {
        while controller.has_demand() {
            if self.current.is_none() {
                match self.next_inner().await? {
                    Some(inner) => {
                        self.current = Some(inner.into_reader()?);
                        self.started_sources += 1;
                    }
                    None => {
                        tracing::trace!(sources = self.started_sources, "Concat exhausted");
                        return controller.close();
                    }
                }
            }
            let Some(current) = self.current.as_mut() else {
                continue;
            };

            match current.read().await? {
                Some(item) => controller.enqueue(item)?,
                // Move on within the same activation so empty sources never stall.
                None => self.current = None,
            }
        }
        Ok(())
    }

    /// Cancels whatever is still held. Failures are logged and swallowed.
    async fn abandon(&mut self, reason: Option<String>) {
        if let Some(mut current) = self.current.take()
            && let Err(e) = current.cancel(reason.clone()).await
        {
            tracing::debug!(error = %e, "Failed to cancel active concat source");
        }
        match &mut self.upcoming {
            Upcoming::Listed(pending) => pending.clear(),
            Upcoming::Outer { stream, reader } => {
                *stream = None;
                if let Some(mut outer) = reader.take()
                    && let Err(e) = outer.cancel(reason).await
                {
                    tracing::debug!(error = %e, "Failed to cancel concat outer source");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> PullSource<T> for ConcatSource<T> {
    async fn start(&mut self, _controller: &Controller<T>) -> Result<()> {
        if let Upcoming::Outer { stream, reader } = &mut self.upcoming
            && let Some(outer) = stream.take()
        {
            *reader = Some(outer.into_reader()?);
        }
        Ok(())
    }

    async fn pull(&mut self, controller: &Controller<T>) -> Result<()> {
        let result = self.pump(controller).await;
        if let Err(ref e) = result {
            self.abandon(Some(format!("concat aborted: {e}"))).await;
        }
        result
    }

    async fn cancel(&mut self, reason: Option<String>) -> Result<()> {
        self.abandon(reason).await;
        Ok(())
    }
}
