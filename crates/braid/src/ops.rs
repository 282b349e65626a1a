//! Single-source operators built on one shared pull loop.
//!
//! A [`Transform`] decides, per upstream item, whether to emit, skip, or end
//! the output early, and may emit one final value when upstream completes.
//! The shared source owns the upstream reader and drives the transform under
//! the downstream's demand.

use crate::error::Result;
use crate::stream::{Controller, PullSource, PullStream, Reader};

/// What a transform does with one upstream item.
#[derive(Debug, PartialEq, Eq)]
pub enum Step<U> {
    Emit(U),
    Skip,
    /// Emit this value, then end the output and cancel upstream.
    Last(U),
    /// End the output without emitting; upstream is cancelled.
    Stop,
}

pub trait Transform<T, U>: Send + 'static {
    fn apply(&mut self, item: T) -> Result<Step<U>>;

    /// Completion policy: a value to emit before closing, if any.
    fn finish(&mut self) -> Result<Option<U>> {
        Ok(None)
    }

    /// True when the output should end before reading anything more.
    fn is_done(&self) -> bool {
        false
    }
}

struct TransformSource<T: Send + 'static, U, X> {
    upstream: Option<PullStream<T>>,
    reader: Option<Reader<T>>,
    transform: X,
    _output: std::marker::PhantomData<fn() -> U>,
}

impl<T, U, X> TransformSource<T, U, X>
where
    T: Send + 'static,
    U: Send + 'static,
    X: Transform<T, U>,
{
    fn new(upstream: PullStream<T>, transform: X) -> Self {
        Self {
            upstream: Some(upstream),
            reader: None,
            transform,
            _output: std::marker::PhantomData,
        }
    }

    async fn pump(&mut self, controller: &Controller<U>) -> Result<()> {
        while controller.has_demand() {
            if self.transform.is_done() {
                self.release(Some("downstream complete".to_string())).await;
                return controller.close();
            }
            let Some(reader) = self.reader.as_mut() else {
                return controller.close();
            };

            let Some(item) = reader.read().await? else {
                self.reader = None;
                if let Some(last) = self.transform.finish()? {
                    controller.enqueue(last)?;
                }
                return controller.close();
            };

            match self.transform.apply(item)? {
                Step::Emit(value) => controller.enqueue(value)?,
                Step::Skip => {}
                Step::Last(value) => {
                    controller.enqueue(value)?;
                    self.release(Some("downstream complete".to_string())).await;
                    return controller.close();
                }
                Step::Stop => {
                    self.release(Some("downstream complete".to_string())).await;
                    return controller.close();
                }
            }
        }
        Ok(())
    }

    /// Cancels and drops the upstream reader. Failures are logged and swallowed.
    async fn release(&mut self, reason: Option<String>) {
        self.upstream = None;
        if let Some(mut reader) = self.reader.take()
            && let Err(e) = reader.cancel(reason).await
        {
            tracing::debug!(error = %e, "Failed to cancel upstream");
        }
    }
}

#[async_trait::async_trait]
impl<T, U, X> PullSource<U> for TransformSource<T, U, X>
where
    T: Send + 'static,
    U: Send + 'static,
    X: Transform<T, U>,
{
    async fn start(&mut self, _controller: &Controller<U>) -> Result<()> {
        if let Some(upstream) = self.upstream.take() {
            self.reader = Some(upstream.into_reader()?);
        }
        Ok(())
    }

    async fn pull(&mut self, controller: &Controller<U>) -> Result<()> {
        let result = self.pump(controller).await;
        if let Err(ref e) = result {
            self.release(Some(format!("downstream errored: {e}"))).await;
        }
        result
    }

    async fn cancel(&mut self, reason: Option<String>) -> Result<()> {
        self.release(reason).await;
        Ok(())
    }
}

struct Map<F>(F);

impl<T, U, F> Transform<T, U> for Map<F>
where
    F: FnMut(T) -> Result<U> + Send + 'static,
{
    fn apply(&mut self, item: T) -> Result<Step<U>> {
        (self.0)(item).map(Step::Emit)
    }
}

struct Filter<P>(P);

impl<T, P> Transform<T, T> for Filter<P>
where
    P: FnMut(&T) -> bool + Send + 'static,
{
    fn apply(&mut self, item: T) -> Result<Step<T>> {
        Ok(if (self.0)(&item) {
            Step::Emit(item)
        } else {
            Step::Skip
        })
    }
}

struct Take {
    remaining: usize,
}

impl<T> Transform<T, T> for Take {
    fn apply(&mut self, item: T) -> Result<Step<T>> {
        self.remaining = self.remaining.saturating_sub(1);
        Ok(if self.remaining == 0 {
            Step::Last(item)
        } else {
            Step::Emit(item)
        })
    }

    fn is_done(&self) -> bool {
        self.remaining == 0
    }
}

struct DefaultIfEmpty<T> {
    default: Option<T>,
}

impl<T: Send + 'static> Transform<T, T> for DefaultIfEmpty<T> {
    fn apply(&mut self, item: T) -> Result<Step<T>> {
        self.default = None;
        Ok(Step::Emit(item))
    }

    fn finish(&mut self) -> Result<Option<T>> {
        Ok(self.default.take())
    }
}

impl<T: Send + 'static> PullStream<T> {
    /// Applies a custom transform under this stream's demand contract.
    pub fn transform<U, X>(self, transform: X) -> PullStream<U>
    where
        U: Send + 'static,
        X: Transform<T, U>,
    {
        PullStream::new(TransformSource::new(self, transform))
    }

    pub fn map<U, F>(self, mut f: F) -> PullStream<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.transform(Map(move |item: T| -> Result<U> { Ok(f(item)) }))
    }

    /// Like [`map`](Self::map), but an `Err` errors the output and cancels upstream.
    pub fn try_map<U, F>(self, f: F) -> PullStream<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Result<U> + Send + 'static,
    {
        self.transform(Map(f))
    }

    pub fn filter<P>(self, predicate: P) -> PullStream<T>
    where
        P: FnMut(&T) -> bool + Send + 'static,
    {
        self.transform(Filter(predicate))
    }

    /// First `n` items, then cancels upstream.
    pub fn take(self, n: usize) -> PullStream<T> {
        self.transform(Take { remaining: n })
    }

    /// Emits `default` when upstream completes without producing anything.
    pub fn default_if_empty(self, default: T) -> PullStream<T> {
        self.transform(DefaultIfEmpty {
            default: Some(default),
        })
    }
}
