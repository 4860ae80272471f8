//! UDP transport between clients and the controller.
//!
//! - **udp**: one signal per datagram, bounded encode/decode, receive with timeout
//! - **client**: request/reply helpers used by GUIs, scripts and the CLI

pub mod client;
pub mod udp;

pub use client::ControllerClient;
pub use udp::{Datagram, TransportError, UdpTransport};
