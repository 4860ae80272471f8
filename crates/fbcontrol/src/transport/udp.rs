//! Datagram transport for signals.
//!
//! One signal per UDP datagram, encoded with the bounded [`SignalCodec`].
//! Sending is fire-and-forget; receiving blocks until a datagram arrives or a
//! caller-supplied timeout elapses.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::bridge::{DecodeError, EncodeError, SignalCodec};
use crate::signal::Signal;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to encode signal: {0}")]
    Encode(#[from] EncodeError),

    #[error("failed to decode datagram from {from}: {source}")]
    Decode {
        from: SocketAddr,
        #[source]
        source: DecodeError,
    },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// A decoded signal and the address it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub signal: Signal,
    pub from: SocketAddr,
}

pub struct UdpTransport {
    socket: UdpSocket,
    codec: SignalCodec,
}

impl UdpTransport {
    /// Bind a socket on `addr`. Port 0 picks an ephemeral port.
    pub async fn bind(addr: SocketAddr, max_datagram_len: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::debug!(local_addr = %socket.local_addr()?, "Bound UDP transport");
        Ok(Self {
            socket,
            codec: SignalCodec::new(max_datagram_len),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn codec(&self) -> SignalCodec {
        self.codec
    }

    pub async fn send(&self, signal: &Signal, addr: SocketAddr) -> Result<(), TransportError> {
        let bytes = self.codec.encode(signal)?;
        self.socket.send_to(&bytes, addr).await?;
        tracing::trace!(%addr, len = bytes.len(), kind = %signal.kind(), "Sent signal");
        Ok(())
    }

    /// Wait for the next datagram without a deadline.
    pub async fn recv(&self) -> Result<Datagram, TransportError> {
        // One extra byte so oversized datagrams are detected instead of
        // silently truncated into something that might still parse.
        let mut buf = vec![0u8; self.codec.max_len() + 1];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        let signal = self
            .codec
            .decode(&buf[..n])
            .map_err(|source| TransportError::Decode { from, source })?;
        Ok(Datagram { signal, from })
    }

    /// Wait up to `timeout` for a datagram.
    ///
    /// Returns `Ok(None)` when nothing arrived in time; the caller decides
    /// whether to retry.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Datagram>, TransportError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Receiving from peer failed (timeout)"
                );
                Ok(None)
            }
        }
    }
}
