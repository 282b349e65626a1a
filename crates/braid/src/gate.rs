//! Async counting gate bounding concurrent work.
//!
//! Built on tokio's fair semaphore, so suspended callers resume in FIFO order.
//! Unlike a semaphore permit, a consumed gate permit is detached from the
//! caller: it only comes back through an explicit [`Gate::increment`], or
//! when a [`GatePermit`] guard is dropped.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{Result, StreamError};

pub struct Gate {
    semaphore: Semaphore,
    initial: usize,
}

impl Gate {
    pub fn new(permits: usize) -> Self {
        let permits = permits.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Semaphore::new(permits),
            initial: permits,
        }
    }

    /// A gate that never makes callers wait in practice.
    pub fn unbounded() -> Self {
        Self::new(Semaphore::MAX_PERMITS)
    }

    /// Suspends until a permit is free, then consumes it.
    ///
    /// Fails with [`StreamError::GateClosed`] if the gate is closed first.
    pub async fn wait(&self) -> Result<()> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| StreamError::GateClosed)?;
        permit.forget();
        Ok(())
    }

    /// Consumes a permit only if one is free right now.
    pub fn try_wait(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Returns one permit, waking the longest waiter or banking it.
    ///
    /// May raise the count above the initial one.
    pub fn increment(&self) {
        if self.semaphore.is_closed() {
            return;
        }
        if self.semaphore.available_permits() >= Semaphore::MAX_PERMITS {
            tracing::warn!("Gate permit count saturated; dropping increment");
            return;
        }
        self.semaphore.add_permits(1);
    }

    /// Waits for a permit wrapped in a guard that returns it on drop.
    pub async fn acquire(self: &Arc<Self>) -> Result<GatePermit> {
        self.wait().await?;
        Ok(GatePermit {
            gate: Arc::clone(self),
        })
    }

    /// Tears the gate down; current and future waiters fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn initial(&self) -> usize {
        self.initial
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("initial", &self.initial)
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A consumed gate permit that is returned when dropped.
#[must_use = "dropping the permit returns it to the gate immediately"]
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<Gate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.increment();
    }
}
