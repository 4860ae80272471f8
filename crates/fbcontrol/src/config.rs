//! Runtime configuration for the transport, the supervisor and the controller.
//!
//! Defaults match the ports and timings the feedback tooling has always used,
//! so a controller and a client started without options find each other.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::bridge::{DEFAULT_MAX_FRAME_LEN, MAX_DATAGRAM_LEN};

pub const DEFAULT_CONTROLLER_PORT: u16 = 12345;
pub const DEFAULT_CLIENT_PORT: u16 = 12346;
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Address the controller binds and clients send to.
    pub host: IpAddr,
    /// Controller-bound traffic.
    pub controller_port: u16,
    /// Replies are sent to the requester's host on this port.
    pub client_port: u16,
    pub max_datagram_len: usize,
    pub receive_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            controller_port: DEFAULT_CONTROLLER_PORT,
            client_port: DEFAULT_CLIENT_PORT,
            max_datagram_len: MAX_DATAGRAM_LEN,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }
}

impl NetworkConfig {
    /// Defaults overridden by `FB_HOST`, `FB_CONTROLLER_PORT`, `FB_CLIENT_PORT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = env_parse::<IpAddr>("FB_HOST")? {
            config.host = host;
        }
        if let Some(port) = env_parse::<u16>("FB_CONTROLLER_PORT")? {
            config.controller_port = port;
        }
        if let Some(port) = env_parse::<u16>("FB_CLIENT_PORT")? {
            config.client_port = port;
        }
        Ok(config)
    }

    pub fn controller_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.controller_port)
    }

    pub fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.client_port)
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_controller_port(mut self, port: u16) -> Self {
        self.controller_port = port;
        self
    }

    pub fn with_client_port(mut self, port: u16) -> Self {
        self.client_port = port;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_max_datagram_len(mut self, len: usize) -> Self {
        self.max_datagram_len = len;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// How long a fresh feedback process may take to report INITIALIZED.
    pub start_timeout: Duration,
    /// Bound for each wait while stopping: process exit, then reader join.
    pub stop_timeout: Duration,
    /// How long a write to a feedback that stopped reading may block.
    pub send_timeout: Duration,
    /// Frame limit on the process channel.
    pub max_frame_len: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(1),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl SupervisorConfig {
    /// Defaults overridden by `FB_START_TIMEOUT_MS`, `FB_STOP_TIMEOUT_MS` and
    /// `FB_SEND_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = env_parse::<u64>("FB_START_TIMEOUT_MS")? {
            config.start_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("FB_STOP_TIMEOUT_MS")? {
            config.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("FB_SEND_TIMEOUT_MS")? {
            config.send_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerConfig {
    pub network: NetworkConfig,
    pub supervisor: SupervisorConfig,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            network: NetworkConfig::from_env()?,
            supervisor: SupervisorConfig::from_env()?,
        })
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }
}

fn env_parse<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => parse_value(var, &value).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_defaults_match_well_known_ports() {
        let config = NetworkConfig::default();
        assert_eq!(config.controller_addr(), "127.0.0.1:12345".parse().unwrap());
        assert_eq!(config.client_addr(), "127.0.0.1:12346".parse().unwrap());
        assert_eq!(config.max_datagram_len, 65535);
        assert_eq!(config.receive_timeout, Duration::from_secs(2));
    }

    #[test]
    fn supervisor_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.stop_timeout, Duration::from_secs(1));
        assert_eq!(config.start_timeout, Duration::from_secs(10));
        assert_eq!(config.send_timeout, Duration::from_secs(1));
        assert_eq!(config.max_frame_len, 1024 * 1024);
    }

    #[test]
    fn builders_override_fields() {
        let config = ControllerConfig::default()
            .with_network(NetworkConfig::default().with_controller_port(0))
            .with_supervisor(SupervisorConfig::default().with_stop_timeout(Duration::from_millis(50)));
        assert_eq!(config.network.controller_port, 0);
        assert_eq!(config.supervisor.stop_timeout, Duration::from_millis(50));
    }

    #[test]
    fn parse_value_reports_variable() {
        let err = parse_value::<u16>("FB_CONTROLLER_PORT", "seventy").unwrap_err();
        assert!(err.to_string().contains("FB_CONTROLLER_PORT"));
        assert_eq!(parse_value::<u16>("FB_CLIENT_PORT", " 4000 ").unwrap(), 4000);
    }
}
