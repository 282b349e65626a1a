//! Length-prefixed JSON framing for bridge frames.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! Works over any AsyncRead/AsyncWrite: pipes, sockets, in-memory duplexes.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Default ceiling for a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    _frame: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Frames longer than `max` bytes are rejected in both directions.
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _frame: PhantomData,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.frames.max_frame_length()
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(bytes) = self.frames.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, frame: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = serde_json::to_vec(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = json.len(), "Encoding bridge frame");
        self.frames.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{BridgeRequest, BridgeResponse};

    #[test]
    fn waits_for_complete_frame() {
        let mut codec = JsonCodec::<BridgeRequest>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(BridgeRequest::PullRequest { desired_size: 3 }, &mut buf)
            .unwrap();

        let mut partial = buf.split_to(buf.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let decoded = codec.decode(&mut partial).unwrap();
        assert_eq!(decoded, Some(BridgeRequest::PullRequest { desired_size: 3 }));
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = JsonCodec::<BridgeResponse<String>>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(BridgeResponse::Chunk { chunk: "a".to_string() }, &mut buf)
            .unwrap();
        codec.encode(BridgeResponse::Done, &mut buf).unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(BridgeResponse::Chunk { chunk: "a".to_string() })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(BridgeResponse::Done));
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_json_is_invalid_data() {
        let mut framing = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        framing.encode(Bytes::from_static(b"{not json"), &mut buf).unwrap();

        let err = JsonCodec::<BridgeRequest>::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::<BridgeResponse<String>>::with_max_frame_length(16);
        assert_eq!(codec.max_frame_length(), 16);

        let mut buf = BytesMut::new();
        let err = codec
            .encode(
                BridgeResponse::Chunk {
                    chunk: "x".repeat(64),
                },
                &mut buf,
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
