//! Network client for a running feedback controller.
//!
//! The client owns one socket bound to the reply port and sends requests from
//! it. Requests that expect an answer carry a [`RequestId`]; replies with a
//! different id are skipped, replies without one (older controllers) are
//! accepted as-is. Request/reply pairs are serialized through a mutex, so a
//! client has at most one outstanding request. Two *separate* clients bound to
//! the same reply port can still steal each other's legacy replies.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::udp::{TransportError, UdpTransport};
use crate::config::NetworkConfig;
use crate::signal::{
    Command, FEEDBACK_KEY, FEEDBACKS_KEY, RequestId, Signal, SignalData, SignalKind,
    VARIABLES_KEY,
};

pub struct ControllerClient {
    transport: UdpTransport,
    controller: SocketAddr,
    timeout: Duration,
    request_lock: Mutex<()>,
}

impl ControllerClient {
    /// Bind the configured client port and target the configured controller.
    pub async fn connect(config: &NetworkConfig) -> io::Result<Self> {
        Self::bind(
            config.client_addr(),
            config.controller_addr(),
            config.receive_timeout,
            config.max_datagram_len,
        )
        .await
    }

    pub async fn bind(
        local: SocketAddr,
        controller: SocketAddr,
        timeout: Duration,
        max_datagram_len: usize,
    ) -> io::Result<Self> {
        let transport = UdpTransport::bind(local, max_datagram_len).await?;
        Ok(Self {
            transport,
            controller,
            timeout,
            request_lock: Mutex::new(()),
        })
    }

    /// Retarget the client at another controller address.
    pub fn with_controller(mut self, controller: SocketAddr) -> Self {
        self.controller = controller;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn controller_addr(&self) -> SocketAddr {
        self.controller
    }

    pub async fn send_signal(&self, signal: &Signal) -> Result<(), TransportError> {
        self.transport.send(signal, self.controller).await
    }

    /// Send `signal` and wait for the matching reply.
    ///
    /// `Ok(None)` means no reply arrived within the receive timeout.
    pub async fn request(&self, signal: Signal) -> Result<Option<Signal>, TransportError> {
        let _guard = self.request_lock.lock().await;

        let id = RequestId::new();
        self.transport
            .send(&signal.with_request_id(id), self.controller)
            .await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::info!(request_id = %id, "No reply from controller");
                return Ok(None);
            }
            match self.transport.receive(remaining).await {
                Ok(Some(datagram)) => {
                    let reply = datagram.signal;
                    if reply.kind() != SignalKind::Reply {
                        tracing::debug!(kind = %reply.kind(), "Skipping non-reply signal");
                        continue;
                    }
                    match reply.request_id() {
                        Some(got) if got != id => {
                            tracing::debug!(expected = %id, %got, "Skipping reply for another request");
                            continue;
                        }
                        _ => return Ok(Some(reply)),
                    }
                }
                Ok(None) => return Ok(None),
                Err(TransportError::Decode { from, source }) => {
                    tracing::warn!(%from, error = %source, "Dropping undecodable reply");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn command(&self, cmd: Command, data: SignalData) -> Result<(), TransportError> {
        self.send_signal(&Signal::command([cmd], data)).await
    }

    /// Names of the feedbacks the controller can load, in registry order.
    pub async fn get_available_feedbacks(&self) -> Result<Option<Vec<String>>, TransportError> {
        let reply = self
            .request(Signal::command([Command::GetFeedbacks], SignalData::new()))
            .await?;
        let Some(reply) = reply else {
            tracing::info!("Did not receive an answer on getfeedbacks");
            return Ok(None);
        };
        let names = reply
            .get(FEEDBACKS_KEY)
            .and_then(|v| v.as_array())
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            });
        Ok(names)
    }

    /// Variables of the running feedback.
    pub async fn get_variables(&self) -> Result<Option<SignalData>, TransportError> {
        let reply = self
            .request(Signal::command([Command::GetVariables], SignalData::new()))
            .await?;
        let Some(reply) = reply else {
            tracing::info!("Did not receive an answer on getvariables");
            return Ok(None);
        };
        Ok(reply
            .get(VARIABLES_KEY)
            .and_then(|v| v.as_object())
            .cloned())
    }

    pub async fn send_init(&self, feedback: &str) -> Result<(), TransportError> {
        let mut data = SignalData::new();
        data.insert(FEEDBACK_KEY.to_string(), feedback.into());
        self.command(Command::SendInit, data).await
    }

    pub async fn play(&self) -> Result<(), TransportError> {
        self.command(Command::Play, SignalData::new()).await
    }

    pub async fn pause(&self) -> Result<(), TransportError> {
        self.command(Command::Pause, SignalData::new()).await
    }

    pub async fn stop(&self) -> Result<(), TransportError> {
        self.command(Command::Stop, SignalData::new()).await
    }

    pub async fn quit(&self) -> Result<(), TransportError> {
        self.command(Command::Quit, SignalData::new()).await
    }

    pub async fn quit_controller(&self) -> Result<(), TransportError> {
        self.command(Command::QuitController, SignalData::new()).await
    }

    pub async fn send_interaction(&self, data: SignalData) -> Result<(), TransportError> {
        self.send_signal(&Signal::interaction(data)).await
    }

    pub async fn send_control(&self, data: SignalData) -> Result<(), TransportError> {
        self.send_signal(&Signal::control(data).stamped()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MAX_DATAGRAM_LEN;
    use crate::signal::data;
    use serde_json::json;

    async fn pair(timeout: Duration) -> (ControllerClient, UdpTransport) {
        let fake_controller = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), MAX_DATAGRAM_LEN)
            .await
            .unwrap();
        let client = ControllerClient::bind(
            "127.0.0.1:0".parse().unwrap(),
            fake_controller.local_addr().unwrap(),
            timeout,
            MAX_DATAGRAM_LEN,
        )
        .await
        .unwrap();
        (client, fake_controller)
    }

    #[tokio::test]
    async fn request_skips_replies_for_other_requests() {
        let (client, controller) = pair(Duration::from_secs(2)).await;

        let server = tokio::spawn(async move {
            let req = controller.recv().await.unwrap();
            let id = req.signal.request_id().expect("request carries an id");

            let stale = Signal::reply(data([("feedbacks", json!(["Stale"]))]))
                .with_request_id(RequestId::new());
            controller.send(&stale, req.from).await.unwrap();

            let answer = Signal::reply(data([("feedbacks", json!(["Timer", "BenchmarkFeedback"]))]))
                .with_request_id(id);
            controller.send(&answer, req.from).await.unwrap();
        });

        let names = client.get_available_feedbacks().await.unwrap().unwrap();
        assert_eq!(names, vec!["Timer", "BenchmarkFeedback"]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn legacy_reply_without_id_is_accepted() {
        let (client, controller) = pair(Duration::from_secs(2)).await;

        let server = tokio::spawn(async move {
            let req = controller.recv().await.unwrap();
            let answer = Signal::reply(data([("variables", json!({"n": 1}))]));
            controller.send(&answer, req.from).await.unwrap();
        });

        let vars = client.get_variables().await.unwrap().unwrap();
        assert_eq!(vars.get("n"), Some(&json!(1)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn request_without_answer_returns_none() {
        let (client, _controller) = pair(Duration::from_millis(100)).await;
        assert!(client.get_available_feedbacks().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_init_carries_feedback_name() {
        let (client, controller) = pair(Duration::from_secs(1)).await;
        client.send_init("Timer").await.unwrap();

        let got = controller.recv().await.unwrap();
        assert_eq!(got.signal.commands(), &[Command::SendInit]);
        assert_eq!(got.signal.feedback_name(), Some("Timer"));
        assert!(got.signal.request_id().is_none());
    }
}
