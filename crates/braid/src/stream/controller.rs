use std::sync::Arc;

use super::Shared;
use crate::error::{Result, StreamError};

/// Producer-side handle onto a stream's buffer.
pub struct Controller<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Controller<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Controller<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Remaining capacity the consumer asked for.
    ///
    /// `Some(0)` once closed or cancelled, `None` once errored. May go
    /// negative when a push-driven producer ignores demand.
    pub fn desired_size(&self) -> Option<isize> {
        self.shared.desired_size()
    }

    /// True while the stream is readable and has room below its high-water mark.
    pub fn has_demand(&self) -> bool {
        self.desired_size().is_some_and(|n| n > 0)
    }

    pub fn is_readable(&self) -> bool {
        self.shared.is_readable()
    }

    pub fn enqueue(&self, item: T) -> Result<()> {
        self.shared.enqueue(item)
    }

    /// Signals completion. Buffered items are still delivered.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Errors the stream and drops buffered items. Ignored once terminal.
    pub fn error(&self, error: StreamError) {
        self.shared.error(error);
    }
}

impl<T> std::fmt::Debug for Controller<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("desired_size", &self.desired_size())
            .finish()
    }
}
