//! Hot multicast producers.
//!
//! A [`Subject`] pushes every value to all current subscribers regardless of
//! their demand. Each call to [`Subject::stream`] creates a new subscriber
//! stream, registered immediately so nothing emitted after the call is
//! missed. Cancelling or dropping that stream unsubscribes it.
//!
//! History policies decide what a late subscriber sees first:
//! - [`Subject::new`]: nothing
//! - [`Subject::replay`]: the last `capacity` values, optionally only those
//!   younger than a time window
//! - [`Subject::stateful`]: the current value
//!
//! A subscriber arriving after completion or error receives the history and
//! then the terminal signal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Result, StreamError};
use crate::stream::{Controller, PullSource, PullStream};

enum History<T> {
    Nothing,
    Replay {
        capacity: usize,
        window: Option<Duration>,
        items: VecDeque<(Instant, T)>,
    },
    Current(T),
}

impl<T: Clone> History<T> {
    fn record(&mut self, value: &T) {
        match self {
            History::Nothing => {}
            History::Replay {
                capacity, items, ..
            } => {
                if items.len() == *capacity {
                    items.pop_front();
                }
                items.push_back((Instant::now(), value.clone()));
            }
            History::Current(current) => *current = value.clone(),
        }
    }

    fn snapshot(&mut self) -> Vec<T> {
        match self {
            History::Nothing => Vec::new(),
            History::Replay { window, items, .. } => {
                if let Some(window) = *window {
                    let now = Instant::now();
                    while items
                        .front()
                        .is_some_and(|(at, _)| now.duration_since(*at) > window)
                    {
                        items.pop_front();
                    }
                }
                items.iter().map(|(_, v)| v.clone()).collect()
            }
            History::Current(current) => vec![current.clone()],
        }
    }
}

#[derive(Clone)]
enum Terminal {
    Completed,
    Errored(StreamError),
}

struct Hub<T> {
    history: History<T>,
    subscribers: Vec<(u64, Controller<T>)>,
    terminal: Option<Terminal>,
    next_id: u64,
}

/// A hot producer feeding any number of [`PullStream`] subscribers.
pub struct Subject<T> {
    hub: Arc<Mutex<Hub<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Subject<T> {
    pub fn new() -> Self {
        Self::with_history(History::Nothing)
    }

    /// Keeps the last `capacity` values (younger than `window`, if given) for
    /// late subscribers. A zero capacity is a configuration error.
    pub fn replay(capacity: usize, window: Option<Duration>) -> Result<Self> {
        if capacity == 0 {
            return Err(StreamError::config("replay capacity must be at least 1"));
        }
        Ok(Self::with_history(History::Replay {
            capacity,
            window,
            items: VecDeque::with_capacity(capacity),
        }))
    }

    /// Holds a current value, starting at `initial`, delivered to each new subscriber.
    pub fn stateful(initial: T) -> Self {
        Self::with_history(History::Current(initial))
    }

    fn with_history(history: History<T>) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                history,
                subscribers: Vec::new(),
                terminal: None,
                next_id: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Hub<T>> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes `value` to every subscriber. Fails with [`StreamError::Closed`]
    /// once the subject has completed or errored.
    pub fn next(&self, value: T) -> Result<()> {
        let mut hub = self.lock();
        if hub.terminal.is_some() {
            return Err(StreamError::Closed);
        }
        hub.history.record(&value);
        // Subscribers whose stream has gone terminal are dropped here.
        hub.subscribers
            .retain(|(_, controller)| controller.enqueue(value.clone()).is_ok());
        Ok(())
    }

    /// Completes every subscriber. Later calls are ignored.
    pub fn complete(&self) {
        let mut hub = self.lock();
        if hub.terminal.is_some() {
            return;
        }
        hub.terminal = Some(Terminal::Completed);
        for (_, controller) in hub.subscribers.drain(..) {
            let _ = controller.close();
        }
    }

    /// Errors every subscriber. Later calls are ignored.
    pub fn error(&self, error: StreamError) {
        let mut hub = self.lock();
        if hub.terminal.is_some() {
            return;
        }
        tracing::debug!(error = %error, subscribers = hub.subscribers.len(), "Subject errored");
        hub.terminal = Some(Terminal::Errored(error.clone()));
        for (_, controller) in hub.subscribers.drain(..) {
            controller.error(error.clone());
        }
    }

    /// A new subscriber stream. History is buffered into it right away.
    pub fn stream(&self) -> PullStream<T> {
        let mut hub = self.lock();
        let id = hub.next_id;
        hub.next_id += 1;

        let stream = PullStream::new(Subscription {
            id,
            hub: Arc::clone(&self.hub),
        });
        let controller = stream.controller();
        for value in hub.history.snapshot() {
            let _ = controller.enqueue(value);
        }

        match hub.terminal.clone() {
            None => hub.subscribers.push((id, controller)),
            Some(Terminal::Completed) => {
                let _ = controller.close();
            }
            Some(Terminal::Errored(e)) => controller.error(e),
        }
        stream
    }

    /// The held value of a stateful subject, or the newest replayed value.
    pub fn value(&self) -> Option<T> {
        let mut hub = self.lock();
        hub.history.snapshot().pop()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminal.is_some()
    }
}

impl<T> std::fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hub = self.hub.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Subject")
            .field("subscribers", &hub.subscribers.len())
            .field("terminated", &hub.terminal.is_some())
            .finish()
    }
}

/// Source side of one subscriber stream. Values are pushed by the subject,
/// so pulling is a no-op.
struct Subscription<T> {
    id: u64,
    hub: Arc<Mutex<Hub<T>>>,
}

impl<T> Subscription<T> {
    fn unsubscribe(&self) {
        let mut hub = self.hub.lock().unwrap_or_else(PoisonError::into_inner);
        hub.subscribers.retain(|(id, _)| *id != self.id);
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> PullSource<T> for Subscription<T> {
    async fn pull(&mut self, _controller: &Controller<T>) -> Result<()> {
        Ok(())
    }

    async fn cancel(&mut self, _reason: Option<String>) -> Result<()> {
        self.unsubscribe();
        Ok(())
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
