//! Elements a flattening operator accepts as inner sources.

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::stream::{PullStream, Reader};

/// One inner source: a stream, an already-acquired reader, or a value that
/// becomes a single-element (or, for collections, multi-element) stream.
pub enum Inner<T: Send + 'static> {
    Stream(PullStream<T>),
    /// Already locked by the caller, including while it waits in the outer
    /// stream's buffer. A merge limit bounds how many of these are pulled at
    /// once, not how many are held.
    Reader(Reader<T>),
    Value(T),
    Deferred(BoxFuture<'static, Result<T>>),
    Collection(Vec<T>),
}

impl<T: Send + 'static> Inner<T> {
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Inner::Deferred(future.boxed())
    }

    /// Normalizes to a reader. An empty collection reads as an empty stream.
    pub fn into_reader(self) -> Result<Reader<T>> {
        match self {
            Inner::Stream(stream) => stream.into_reader(),
            Inner::Reader(reader) => Ok(reader),
            Inner::Value(value) => PullStream::iter(std::iter::once(value)).into_reader(),
            Inner::Deferred(future) => PullStream::once(future).into_reader(),
            Inner::Collection(values) => PullStream::iter(values).into_reader(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Inner::Stream(_) => "stream",
            Inner::Reader(_) => "reader",
            Inner::Value(_) => "value",
            Inner::Deferred(_) => "deferred",
            Inner::Collection(_) => "collection",
        }
    }
}

impl<T: Send + 'static> From<PullStream<T>> for Inner<T> {
    fn from(stream: PullStream<T>) -> Self {
        Inner::Stream(stream)
    }
}

impl<T: Send + 'static> From<Reader<T>> for Inner<T> {
    fn from(reader: Reader<T>) -> Self {
        Inner::Reader(reader)
    }
}

impl<T: Send + 'static> From<Vec<T>> for Inner<T> {
    fn from(values: Vec<T>) -> Self {
        Inner::Collection(values)
    }
}

impl<T: Send + 'static> std::fmt::Debug for Inner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Inner").field(&self.kind()).finish()
    }
}
