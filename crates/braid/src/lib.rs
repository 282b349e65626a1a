//! braid: pull-driven, backpressured async streams.
//!
//! A [`PullStream`] produces values only when its single [`Reader`] asks for
//! them. Operators build new streams on top of existing ones while keeping
//! that contract end to end, most notably the two flattening disciplines:
//! [`concat`] drains inner sources one after another, and [`merge`] drains up
//! to N of them at once.

mod error;
mod inner;
mod ops;

pub mod bridge;
pub mod concat;
pub mod config;
pub mod gate;
pub mod merge;
pub mod queue;
pub mod scheduler;
pub mod stream;
pub mod subject;

pub use concat::{concat, concat_all, concat_values};
pub use config::{Concurrency, MergeConfig, StreamConfig};
pub use error::{Result, StreamError};
pub use gate::{Gate, GatePermit};
pub use inner::Inner;
pub use merge::{merge, merge_streams};
pub use ops::{Step, Transform};
pub use queue::{BlockingQueue, Dequeued, TryPull};
pub use scheduler::{FrameScheduler, IdleScheduler, ImmediateScheduler, Scheduler};
pub use stream::{Controller, PullSource, PullStream, Reader};
pub use subject::Subject;
