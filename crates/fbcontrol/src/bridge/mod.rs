//! Signal encoding shared by the UDP transport and the process channel.
//!
//! # Architecture
//!
//! - **protocol**: JSON envelope, [`SignalCodec`] with its size bound, errors
//! - **codec**: length-prefixed framing for AsyncRead/AsyncWrite channels

pub mod codec;
pub mod protocol;

pub use codec::{ChannelError, DEFAULT_MAX_FRAME_LEN, SignalFrameCodec};
pub use protocol::{
    DecodeError, EncodeError, MAX_DATAGRAM_LEN, PROTOCOL_VERSION, SignalCodec, decode, encode,
};
