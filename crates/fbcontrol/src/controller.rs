//! The feedback controller: network front end for the supervisor.
//!
//! One control loop owns the UDP socket, the supervisor and the reply router.
//! Commands are handled strictly in arrival order, so a client that sends
//! `sendinit` and then `play` always plays the feedback it just started.
//!
//! Routing by first command:
//! - `getfeedbacks` → reply with registry names
//! - `sendinit` → start the feedback named in `_feedback`
//! - `stop` / `quit` → full stop of the running feedback
//! - `getvariables` → forwarded; the feedback's answer is routed back
//! - `quitfeedbackcontroller` → stop the feedback and leave the loop
//! - anything else (play, pause, interaction, control) → forwarded

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::watch;

use crate::config::ControllerConfig;
use crate::feedback::FeedbackRegistry;
use crate::launcher::FeedbackLauncher;
use crate::signal::{Command, FEEDBACKS_KEY, RequestId, Signal, SignalData, SignalKind};
use crate::supervisor::{FeedbackReplies, FeedbackSupervisor, SupervisorError};
use crate::transport::{Datagram, TransportError, UdpTransport};

/// Pending request ids older than this are forgotten.
const PENDING_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to bind controller socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Remembers who asked for what so replies from the feedback reach the right
/// peer. Owned by the control loop, so no locking.
#[derive(Debug, Default)]
struct ReplyRouter {
    pending: HashMap<RequestId, (SocketAddr, Instant)>,
    legacy: Option<SocketAddr>,
}

impl ReplyRouter {
    fn remember(&mut self, id: Option<RequestId>, peer: SocketAddr) {
        match id {
            Some(id) => {
                let now = Instant::now();
                self.pending
                    .retain(|_, (_, at)| now.duration_since(*at) < PENDING_TTL);
                self.pending.insert(id, (peer, now));
            }
            None => self.legacy = Some(peer),
        }
    }

    fn resolve(&mut self, id: Option<RequestId>) -> Option<SocketAddr> {
        match id {
            Some(id) => self.pending.remove(&id).map(|(peer, _)| peer),
            None => self.legacy,
        }
    }
}

/// Cloneable trigger that stops a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ControllerHandle {
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

pub struct FeedbackController {
    transport: UdpTransport,
    supervisor: FeedbackSupervisor,
    replies: FeedbackReplies,
    router: ReplyRouter,
    client_port: u16,
    shutdown: Arc<watch::Sender<bool>>,
}

impl FeedbackController {
    pub async fn bind(
        config: ControllerConfig,
        launcher: Arc<dyn FeedbackLauncher>,
        registry: FeedbackRegistry,
    ) -> Result<Self, ControllerError> {
        let addr = config.network.controller_addr();
        let transport = UdpTransport::bind(addr, config.network.max_datagram_len)
            .await
            .map_err(|source| ControllerError::Bind { addr, source })?;
        let (supervisor, replies) = FeedbackSupervisor::new(launcher, registry, config.supervisor);

        Ok(Self {
            transport,
            supervisor,
            replies,
            router: ReplyRouter::default(),
            client_port: config.network.client_port,
            shutdown: Arc::new(watch::Sender::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn supervisor(&self) -> &FeedbackSupervisor {
        &self.supervisor
    }

    /// Serve until `quitfeedbackcontroller` arrives or the handle fires.
    /// The running feedback is stopped on the way out.
    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        if let Ok(addr) = self.transport.local_addr() {
            tracing::info!(%addr, "Feedback controller listening");
        }

        loop {
            tokio::select! {
                received = self.transport.recv() => {
                    match received {
                        Ok(datagram) => {
                            if self.handle_datagram(datagram).await == Flow::Exit {
                                break;
                            }
                        }
                        Err(TransportError::Decode { from, source }) => {
                            tracing::warn!(%from, error = %source, "Dropping undecodable datagram");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Receive failed");
                        }
                    }
                }
                Some(reply) = self.replies.recv() => {
                    self.route_reply(reply).await;
                }
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            }
        }

        if let Some(report) = self.supervisor.stop_feedback().await {
            tracing::info!(feedback = %report.name, state = %report.final_state, "Stopped feedback on exit");
        }
        let failed = self.supervisor.failed_stops();
        if !failed.is_empty() {
            tracing::warn!(?failed, "Some feedbacks failed to stop");
        }
        tracing::info!("Feedback controller exited");
    }

    fn reply_addr(&self, peer: SocketAddr) -> SocketAddr {
        SocketAddr::new(peer.ip(), self.client_port)
    }

    async fn handle_datagram(&mut self, datagram: Datagram) -> Flow {
        let Datagram { signal, from } = datagram;
        tracing::debug!(%from, kind = %signal.kind(), commands = ?signal.commands(), "Received signal");

        if let Some(report) = self.supervisor.reap().await {
            tracing::warn!(feedback = %report.name, state = %report.final_state, "Reaped exited feedback");
        }

        match signal.kind() {
            SignalKind::Command => self.handle_command(signal, from).await,
            SignalKind::Interaction | SignalKind::Control => {
                self.forward(signal).await;
                Flow::Continue
            }
            SignalKind::Reply => {
                tracing::warn!(%from, "Ignoring reply sent to controller");
                Flow::Continue
            }
        }
    }

    async fn handle_command(&mut self, signal: Signal, from: SocketAddr) -> Flow {
        let Some(cmd) = signal.first_command() else {
            return Flow::Continue;
        };

        match cmd {
            Command::GetFeedbacks => {
                let names = self.supervisor.registry().names();
                let mut data = SignalData::new();
                data.insert(FEEDBACKS_KEY.to_string(), json!(names));
                let mut reply = Signal::reply(data);
                if let Some(id) = signal.request_id() {
                    reply = reply.with_request_id(id);
                }
                self.send_reply(&reply, self.reply_addr(from)).await;
            }
            Command::SendInit => match signal.feedback_name() {
                Some(name) => {
                    if let Err(e) = self.supervisor.start_feedback(name).await {
                        tracing::error!(feedback = name, error = %e, "Could not start feedback");
                    }
                }
                None => tracing::warn!(%from, "sendinit without a feedback name"),
            },
            Command::Stop | Command::Quit => {
                if self.supervisor.stop_feedback().await.is_none() {
                    tracing::info!(command = %cmd, "No feedback running");
                }
            }
            Command::GetVariables => {
                let peer = self.reply_addr(from);
                self.router.remember(signal.request_id(), peer);
                self.forward(signal).await;
            }
            Command::QuitController => {
                tracing::info!(%from, "Quit requested by client");
                return Flow::Exit;
            }
            Command::Play | Command::Pause => self.forward(signal).await,
        }
        Flow::Continue
    }

    async fn forward(&mut self, signal: Signal) {
        match self.supervisor.send(signal).await {
            Ok(()) => {}
            Err(SupervisorError::NotRunning) => {
                tracing::warn!("No feedback running, dropping signal");
            }
            Err(e) => tracing::error!(error = %e, "Failed to forward signal"),
        }
    }

    async fn route_reply(&mut self, reply: Signal) {
        match self.router.resolve(reply.request_id()) {
            Some(peer) => self.send_reply(&reply, peer).await,
            None => tracing::warn!(request_id = ?reply.request_id(), "No requester for feedback reply"),
        }
    }

    async fn send_reply(&self, reply: &Signal, peer: SocketAddr) {
        if let Err(e) = self.transport.send(reply, peer).await {
            tracing::error!(%peer, error = %e, "Failed to send reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MAX_DATAGRAM_LEN;
    use crate::config::{NetworkConfig, SupervisorConfig};
    use crate::launcher::InProcessLauncher;
    use crate::signal::{data, now_timestamp};
    use crate::transport::ControllerClient;
    use tokio::task::JoinHandle;

    struct Running {
        client: ControllerClient,
        handle: ControllerHandle,
        task: JoinHandle<()>,
    }

    async fn start_controller() -> Running {
        let client = ControllerClient::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(500),
            MAX_DATAGRAM_LEN,
        )
        .await
        .unwrap();

        let network = NetworkConfig::default()
            .with_controller_port(0)
            .with_client_port(client.local_addr().unwrap().port());
        let supervisor = SupervisorConfig::default()
            .with_start_timeout(Duration::from_secs(2))
            .with_stop_timeout(Duration::from_millis(500));
        let config = ControllerConfig::default()
            .with_network(network)
            .with_supervisor(supervisor);

        let registry = FeedbackRegistry::with_builtin();
        let launcher = Arc::new(InProcessLauncher::new(registry.clone()));
        let controller = FeedbackController::bind(config, launcher, registry)
            .await
            .unwrap();
        let addr = controller.local_addr().unwrap();
        let handle = controller.handle();
        let task = tokio::spawn(controller.run());

        Running {
            client: client.with_controller(addr),
            handle,
            task,
        }
    }

    #[tokio::test]
    async fn get_feedbacks_lists_registry_in_order() {
        let running = start_controller().await;
        let names = running
            .client
            .get_available_feedbacks()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(names, vec!["BenchmarkFeedback", "Timer", "TrivialFeedback"]);
        running.handle.shutdown();
        running.task.await.unwrap();
    }

    #[tokio::test]
    async fn init_play_and_read_variables() {
        let running = start_controller().await;
        let client = &running.client;

        client.send_init("Timer").await.unwrap();
        client.play().await.unwrap();

        let elapsed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(vars) = client.get_variables().await.unwrap()
                    && let Some(elapsed) = vars.get("elapsed").and_then(|v| v.as_f64())
                {
                    return elapsed;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(elapsed >= 0.0);

        running.handle.shutdown();
        running.task.await.unwrap();
    }

    #[tokio::test]
    async fn control_signals_reach_feedback() {
        let running = start_controller().await;
        let client = &running.client;

        client.send_init("BenchmarkFeedback").await.unwrap();
        for id in 0..3 {
            client
                .send_control(data([("tuple", json!([id, now_timestamp()]))]))
                .await
                .unwrap();
        }

        let vars = client.get_variables().await.unwrap().unwrap();
        let samples = vars["data"].as_array().unwrap();
        assert_eq!(samples.len(), 3);

        running.handle.shutdown();
        running.task.await.unwrap();
    }

    #[tokio::test]
    async fn stop_leaves_nothing_to_query() {
        let running = start_controller().await;
        let client = &running.client;

        client.send_init("Timer").await.unwrap();
        assert!(client.get_variables().await.unwrap().is_some());
        client.stop().await.unwrap();
        assert!(client.get_variables().await.unwrap().is_none());

        running.handle.shutdown();
        running.task.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_does_not_kill_controller() {
        let running = start_controller().await;
        let raw = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"<xml>nope</xml>", running.client.controller_addr())
            .await
            .unwrap();

        let names = running.client.get_available_feedbacks().await.unwrap();
        assert!(names.is_some());
        running.handle.shutdown();
        running.task.await.unwrap();
    }

    #[tokio::test]
    async fn quit_controller_ends_run() {
        let running = start_controller().await;
        running.client.send_init("Timer").await.unwrap();
        running.client.quit_controller().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), running.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_feedback_keeps_controller_alive() {
        let running = start_controller().await;
        running.client.send_init("Pong").await.unwrap();
        assert!(running.client.get_variables().await.unwrap().is_none());
        assert!(running.client.get_available_feedbacks().await.unwrap().is_some());
        running.handle.shutdown();
        running.task.await.unwrap();
    }

    #[test]
    fn router_prefers_request_id() {
        let mut router = ReplyRouter::default();
        let a: SocketAddr = "10.0.0.1:12346".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:12346".parse().unwrap();
        let id = RequestId::new();

        router.remember(Some(id), a);
        router.remember(None, b);
        assert_eq!(router.resolve(Some(id)), Some(a));
        assert_eq!(router.resolve(Some(id)), None);
        assert_eq!(router.resolve(None), Some(b));
    }
}
