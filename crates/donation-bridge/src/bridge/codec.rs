//! Framed codec for worker communication.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON body.
//! Works over any AsyncRead/AsyncWrite (child stdio, in-memory duplex, sockets).
//!
//! Per-frame failures (bad JSON, oversized frames) are yielded as
//! `Ok(Some(Err(..)))` rather than as decoder errors, so a single bad frame
//! never terminates the stream: `FramedRead` stops after the first `Err`.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const HEADER_LEN: usize = 4;

/// Default upper bound for a single frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    encoder: LengthDelimitedCodec,
    max_frame_bytes: usize,
    /// Bytes of an oversized frame still to be skipped.
    discarding: usize,
    /// Length of the oversized frame being skipped, reported once skipping ends.
    discarded_len: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            encoder: LengthDelimitedCodec::builder()
                .length_field_length(HEADER_LEN)
                .max_frame_length(max_frame_bytes)
                .new_codec(),
            max_frame_bytes,
            discarding: 0,
            discarded_len: 0,
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, CodecError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.discarding > 0 {
            let skip = self.discarding.min(src.len());
            src.advance(skip);
            self.discarding -= skip;
            if self.discarding > 0 {
                return Ok(None);
            }
            tracing::warn!(
                len = self.discarded_len,
                max = self.max_frame_bytes,
                "Discarded oversized frame"
            );
            return Ok(Some(Err(CodecError::Oversized {
                len: self.discarded_len,
                max: self.max_frame_bytes,
            })));
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_bytes {
            src.advance(HEADER_LEN);
            self.discarding = len;
            self.discarded_len = len;
            return self.decode(src);
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len);
        let item = serde_json::from_slice(&body).map_err(|e| CodecError::Malformed(e.to_string()));
        Ok(Some(item))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let json_len = json.len();
        if json_len > self.max_frame_bytes {
            return Err(CodecError::Oversized {
                len: json_len,
                max: self.max_frame_bytes,
            });
        }
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 1_000_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.encoder
            .encode(Bytes::from(json), dst)
            .map_err(CodecError::from)
    }
}
