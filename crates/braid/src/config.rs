//! Stream and merge configuration.
//!
//! Defaults can be overridden from the environment:
//! - `BRAID_HIGH_WATER_MARK`: per-stream buffer capacity (default 1)
//! - `BRAID_MERGE_CONCURRENCY`: merge concurrency limit (default unbounded)

use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::error::{Result, StreamError};
use crate::scheduler::{ImmediateScheduler, Scheduler};

const DEFAULT_HIGH_WATER_MARK: usize = 1;

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<usize>().ok())
}

/// Buffer sizing for a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    high_water_mark: NonZeroUsize,
}

impl StreamConfig {
    pub fn new(high_water_mark: usize) -> Result<Self> {
        let high_water_mark = NonZeroUsize::new(high_water_mark)
            .ok_or_else(|| StreamError::config("high water mark must be at least 1"))?;
        Ok(Self { high_water_mark })
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.get()
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        let high_water_mark = env_usize("BRAID_HIGH_WATER_MARK")
            .and_then(NonZeroUsize::new)
            .or(NonZeroUsize::new(DEFAULT_HIGH_WATER_MARK))
            .unwrap_or(NonZeroUsize::MIN);
        Self { high_water_mark }
    }
}

/// How many inner streams merge drains at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Bounded(usize),
    Unbounded,
}

impl Concurrency {
    /// Permit count for the merge gate; `None` when unbounded.
    pub(crate) fn limit(&self) -> Result<Option<usize>> {
        match *self {
            Concurrency::Bounded(0) => {
                Err(StreamError::config("merge concurrency must be at least 1"))
            }
            Concurrency::Bounded(n) => Ok(Some(n)),
            Concurrency::Unbounded => Ok(None),
        }
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        match env_usize("BRAID_MERGE_CONCURRENCY") {
            Some(n) if n > 0 => Concurrency::Bounded(n),
            _ => Concurrency::Unbounded,
        }
    }
}

impl From<usize> for Concurrency {
    fn from(n: usize) -> Self {
        Concurrency::Bounded(n)
    }
}

impl std::fmt::Display for Concurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Concurrency::Bounded(n) => write!(f, "{}", n),
            Concurrency::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Settings for concurrent flattening.
#[derive(Clone)]
pub struct MergeConfig {
    pub concurrency: Concurrency,
    pub scheduler: Arc<dyn Scheduler>,
    pub stream: StreamConfig,
}

impl MergeConfig {
    pub fn new(concurrency: impl Into<Concurrency>) -> Self {
        Self {
            concurrency: concurrency.into(),
            ..Self::default()
        }
    }

    pub fn with_scheduler(mut self, scheduler: impl Scheduler) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    pub fn with_stream_config(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::default(),
            scheduler: Arc::new(ImmediateScheduler),
            stream: StreamConfig::default(),
        }
    }
}

impl std::fmt::Debug for MergeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeConfig")
            .field("concurrency", &self.concurrency)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}
