//! Framed codec for the controller/feedback process channel.
//!
//! Uses LengthDelimitedCodec for framing + the signal envelope for the payload.
//! Works over any AsyncRead/AsyncWrite (child pipes, in-memory duplex, sockets).

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::SignalCodec;
use crate::signal::Signal;

/// Default upper bound for one frame on the process channel (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Failure on the controller/feedback process channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("process channel closed")]
    Closed,

    #[error("process channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Codec that frames signals with a 4-byte length prefix.
///
/// The frame limit is independent of the UDP datagram bound: a feedback may
/// hand back variables far larger than a datagram.
pub struct SignalFrameCodec {
    inner: LengthDelimitedCodec,
    signals: SignalCodec,
}

impl Default for SignalFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl SignalFrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_len)
                .new_codec(),
            signals: SignalCodec::new(max_frame_len),
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.signals.max_len()
    }
}

impl Decoder for SignalFrameCodec {
    type Item = Signal;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let signal = self
                    .signals
                    .decode(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(signal))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Signal> for SignalFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Signal, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = self
            .signals
            .encode(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if bytes.len() > 100_000 {
            tracing::debug!(
                frame_size_bytes = bytes.len(),
                frame_size_kb = bytes.len() / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(bytes), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Command, SignalData, data};
    use serde_json::json;

    #[test]
    fn frames_round_trip_back_to_back() {
        let mut codec = SignalFrameCodec::default();
        let mut buf = BytesMut::new();

        let first = Signal::command([Command::Play], SignalData::new());
        let second = Signal::control(data([("tuple", json!([1, 0.5]))]));
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = SignalFrameCodec::default();
        let mut full = BytesMut::new();
        let signal = Signal::reply(data([("variables", json!({"n": 3}))]));
        codec.encode(signal.clone(), &mut full).unwrap();

        let mut partial = full.split_to(full.len() / 2);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(full);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(signal));
    }

    #[test]
    fn oversized_frame_is_rejected_on_encode() {
        let mut codec = SignalFrameCodec::new(64);
        let mut buf = BytesMut::new();
        let big = Signal::control(data([("pad", json!("x".repeat(128)))]));
        let err = codec.encode(big, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected_on_decode() {
        let mut big_codec = SignalFrameCodec::new(4096);
        let mut buf = BytesMut::new();
        let big = Signal::control(data([("pad", json!("x".repeat(128)))]));
        big_codec.encode(big, &mut buf).unwrap();

        let mut small_codec = SignalFrameCodec::new(64);
        assert!(small_codec.decode(&mut buf).is_err());
    }

    #[test]
    fn garbage_frame_is_invalid_data() {
        let mut codec = SignalFrameCodec::default();
        let mut buf = BytesMut::new();
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec()
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
