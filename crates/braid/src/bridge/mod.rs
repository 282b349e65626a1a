//! Cross-thread bridge for pull streams.
//!
//! Relays the pull/cancel contract of a [`PullStream`](crate::PullStream)
//! over any byte transport, so a producer on one thread or runtime can feed a
//! consumer on another without giving up backpressure.
//!
//! # Architecture
//!
//! - **protocol**: wire frames (`pull_request`, `cancel`, `chunk`, `done`, `error`)
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **transport**: `serve` (producer side) and `connect` (consumer side)

pub mod codec;
pub mod protocol;
pub mod transport;

pub use transport::{connect, connect_with_config, serve};
