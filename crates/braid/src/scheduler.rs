//! Schedulers pace how fast merge admits new inner streams.
//!
//! A scheduler exposes a single suspension point, [`Scheduler::next_tick`].
//! Implementations are interchangeable and must always resume eventually.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};

use crate::error::{Result, StreamError};

#[async_trait::async_trait]
pub trait Scheduler: Send + Sync + 'static {
    /// Suspend until the scheduler lets the caller continue.
    async fn next_tick(&self);
}

/// Resumes after a single yield to the runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

#[async_trait::async_trait]
impl Scheduler for ImmediateScheduler {
    async fn next_tick(&self) {
        tokio::task::yield_now().await;
    }
}

/// Resumes on frame boundaries of a fixed period.
///
/// Callers arriving within the same frame are resumed on successive frames,
/// so at most one caller proceeds per frame.
pub struct FrameScheduler {
    period: Duration,
    interval: Mutex<Option<Interval>>,
}

impl FrameScheduler {
    pub fn new(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(StreamError::config("frame period must be non-zero"));
        }
        Ok(Self {
            period,
            interval: Mutex::new(None),
        })
    }

    /// Roughly 60 frames per second.
    pub fn sixty_hz() -> Self {
        Self {
            period: Duration::from_micros(16_667),
            interval: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("period", &self.period)
            .finish()
    }
}

#[async_trait::async_trait]
impl Scheduler for FrameScheduler {
    async fn next_tick(&self) {
        let mut guard = self.interval.lock().await;
        // Created lazily so construction does not need a runtime.
        let interval = guard.get_or_insert_with(|| {
            let start = tokio::time::Instant::now() + self.period;
            let mut interval = tokio::time::interval_at(start, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        interval.tick().await;
    }
}

/// Resumes once the runtime has had `spins` chances to run other ready tasks.
#[derive(Debug, Clone, Copy)]
pub struct IdleScheduler {
    spins: usize,
}

impl IdleScheduler {
    pub fn new(spins: usize) -> Result<Self> {
        if spins == 0 {
            return Err(StreamError::config("idle scheduler needs at least one spin"));
        }
        Ok(Self { spins })
    }

    pub fn spins(&self) -> usize {
        self.spins
    }
}

impl Default for IdleScheduler {
    fn default() -> Self {
        Self { spins: 4 }
    }
}

#[async_trait::async_trait]
impl Scheduler for IdleScheduler {
    async fn next_tick(&self) {
        for _ in 0..self.spins {
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_frame_period_is_rejected() {
        let err = FrameScheduler::new(Duration::ZERO).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn zero_idle_spins_is_rejected() {
        assert!(IdleScheduler::new(0).unwrap_err().is_config());
        assert_eq!(IdleScheduler::new(3).unwrap().spins(), 3);
    }

    #[tokio::test]
    async fn immediate_resumes() {
        ImmediateScheduler.next_tick().await;
        IdleScheduler::default().next_tick().await;
    }

    #[tokio::test(start_paused = true)]
    async fn frame_scheduler_waits_for_frame_boundaries() {
        let scheduler = FrameScheduler::new(Duration::from_millis(10)).unwrap();
        let start = tokio::time::Instant::now();

        scheduler.next_tick().await;
        scheduler.next_tick().await;
        scheduler.next_tick().await;

        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
