//! Wire format for signals.
//!
//! Signals travel as a JSON envelope:
//!
//! ```json
//! {"version":"1.0","type":"interaction-signal","commands":["play"],"data":{}}
//! ```
//!
//! `type` uses the tags of the bci-signal protocol. A command signal is
//! an `interaction-signal` with a non-empty command list, so JSON peers that
//! predate the command kind keep working. Unknown envelope fields are ignored,
//! unknown command tokens are dropped.

use serde::{Deserialize, Serialize};

use crate::signal::{Command, RequestId, Signal, SignalData, SignalKind};

pub const PROTOCOL_VERSION: &str = "1.0";

/// Largest payload that fits one UDP datagram.
pub const MAX_DATAGRAM_LEN: usize = 65535;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encoded signal is {len} bytes, exceeding the {limit} byte bound")]
    Oversized { len: usize, limit: usize },

    #[error("timestamp must be a finite number")]
    NonFiniteTimestamp,

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is {len} bytes, exceeding the {limit} byte bound")]
    Oversized { len: usize, limit: usize },

    #[error("malformed signal: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum WireType {
    #[serde(rename = "interaction-signal")]
    Interaction,
    #[serde(rename = "control-signal")]
    Control,
    #[serde(rename = "reply")]
    Reply,
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    version: &'static str,
    #[serde(rename = "type")]
    kind: WireType,
    commands: Vec<&'static str>,
    data: &'a SignalData,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<RequestId>,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(default)]
    version: Option<String>,
    #[serde(rename = "type")]
    kind: WireType,
    #[serde(default)]
    commands: Option<Vec<WireCommand>>,
    #[serde(default)]
    data: Option<SignalData>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    request_id: Option<RequestId>,
}

/// Older peers send `["cmd", {kwargs}]` pairs instead of bare tokens.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireCommand {
    Token(String),
    WithArgs(String, serde_json::Value),
}

impl WireCommand {
    fn token(&self) -> &str {
        match self {
            Self::Token(t) => t,
            Self::WithArgs(t, _) => t,
        }
    }
}

/// Encoder/decoder for one signal with an upper bound on the encoded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalCodec {
    max_len: usize,
}

impl Default for SignalCodec {
    fn default() -> Self {
        Self::datagram()
    }
}

impl SignalCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Codec bounded by [`MAX_DATAGRAM_LEN`].
    pub fn datagram() -> Self {
        Self::new(MAX_DATAGRAM_LEN)
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn encode(&self, signal: &Signal) -> Result<Vec<u8>, EncodeError> {
        if let Some(ts) = signal.timestamp()
            && !ts.is_finite()
        {
            return Err(EncodeError::NonFiniteTimestamp);
        }

        let kind = match signal.kind() {
            SignalKind::Command | SignalKind::Interaction => WireType::Interaction,
            SignalKind::Control => WireType::Control,
            SignalKind::Reply => WireType::Reply,
        };

        let envelope = OutgoingEnvelope {
            version: PROTOCOL_VERSION,
            kind,
            commands: signal.commands().iter().map(Command::as_str).collect(),
            data: signal.data(),
            timestamp: signal.timestamp(),
            request_id: signal.request_id(),
        };

        let bytes = serde_json::to_vec(&envelope)?;
        if bytes.len() > self.max_len {
            return Err(EncodeError::Oversized {
                len: bytes.len(),
                limit: self.max_len,
            });
        }
        tracing::trace!(len = bytes.len(), kind = %signal.kind(), "Encoded signal");
        Ok(bytes)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Signal, DecodeError> {
        if bytes.len() > self.max_len {
            return Err(DecodeError::Oversized {
                len: bytes.len(),
                limit: self.max_len,
            });
        }

        let envelope: IncomingEnvelope = serde_json::from_slice(bytes)?;

        if let Some(version) = envelope.version.as_deref()
            && version.split('.').next() != Some("1")
        {
            return Err(DecodeError::UnsupportedVersion(version.to_string()));
        }

        let mut commands = Vec::new();
        for wire in envelope.commands.unwrap_or_default() {
            match wire.token().parse::<Command>() {
                Ok(cmd) => commands.push(cmd),
                Err(e) => tracing::warn!(error = %e, "Ignoring unknown command"),
            }
        }

        let kind = match envelope.kind {
            WireType::Interaction if commands.is_empty() => SignalKind::Interaction,
            WireType::Interaction => SignalKind::Command,
            WireType::Control => SignalKind::Control,
            WireType::Reply => SignalKind::Reply,
        };
        if kind != SignalKind::Command && !commands.is_empty() {
            tracing::warn!(%kind, ?commands, "Ignoring commands on non-interaction signal");
            commands.clear();
        }

        Ok(Signal::from_parts(
            kind,
            commands,
            envelope.data.unwrap_or_default(),
            envelope.timestamp,
            envelope.request_id,
        ))
    }
}

/// Encode with the datagram bound.
pub fn encode(signal: &Signal) -> Result<Vec<u8>, EncodeError> {
    SignalCodec::datagram().encode(signal)
}

/// Decode with the datagram bound.
pub fn decode(bytes: &[u8]) -> Result<Signal, DecodeError> {
    SignalCodec::datagram().decode(bytes)
}
