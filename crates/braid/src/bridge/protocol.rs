//! Bridge wire frames.
//!
//! The consumer side sends [`BridgeRequest`]s; the producer side answers with
//! [`BridgeResponse`]s. Every `pull_request` is answered with exactly
//! `desired_size` chunks, or fewer followed by `done` or `error`.

use serde::{Deserialize, Serialize};

/// Consumer to producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    PullRequest {
        desired_size: usize,
    },
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Producer to consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeResponse<T> {
    Chunk { chunk: T },
    Done,
    Error { message: String },
}
