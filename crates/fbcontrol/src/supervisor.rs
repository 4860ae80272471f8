//! Supervisor for the single active feedback process.
//!
//! # Ownership
//!
//! - The control side ([`FeedbackSupervisor`]) is the only writer of commands
//!   on the channel and only *reads* the lifecycle state.
//! - Each [`FeedbackHandle`] owns a reader task, the only reader of the
//!   channel and the only writer of the state. It applies `_state` reports from
//!   the feedback and forwards every other reply (e.g. variables) to the
//!   supervisor's reply stream.
//! - Closing the write side is the cancellation primitive. The worker sees
//!   end-of-stream and exits, the reader task sees end-of-stream and records
//!   the final state.
//!
//! # Stop sequence
//!
//! STOP + QUIT → close writer → wait for exit (bounded) → kill if still alive
//! → wait again (bounded) → record "failed to stop" if it survives → join the
//! reader (bounded, aborted on timeout). No step blocks past its bound. If the
//! feedback stopped reading, delivering STOP times out and the first wait is
//! skipped.
//!
//! Every other write is bounded by `send_timeout`; a feedback that misses it
//! is stopped the same way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::{ChannelError, SignalFrameCodec};
use crate::config::SupervisorConfig;
use crate::feedback::{FeedbackRegistry, RegistryError};
use crate::launcher::{
    ChannelReader, ChannelWriter, FeedbackLauncher, FeedbackProcess, LaunchError,
    LaunchedFeedback,
};
use crate::signal::{Command, ERROR_KEY, STATE_KEY, Signal, SignalData, SignalKind};
use crate::state::FeedbackState;
use crate::worker::FAILED_REPORT;

/// Replies from the feedback that are not lifecycle reports.
pub type FeedbackReplies = mpsc::Receiver<Signal>;

const REPLY_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("cannot start feedback: {0}")]
    UnknownFeedback(#[from] RegistryError),

    #[error("failed to launch feedback {name}: {source}")]
    Launch {
        name: String,
        #[source]
        source: LaunchError,
    },

    #[error("feedback {name} did not initialize within {timeout:?}")]
    StartTimeout { name: String, timeout: Duration },

    #[error("feedback {name} failed to start: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("no feedback is running")]
    NotRunning,

    #[error("feedback {name} did not accept a signal within {timeout:?}")]
    SendTimeout { name: String, timeout: Duration },

    #[error("failed to send to feedback {name}: {source}")]
    Channel {
        name: String,
        #[source]
        source: ChannelError,
    },
}

impl SupervisorError {
    /// The requested feedback is not running because starting it failed.
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            Self::UnknownFeedback(_)
                | Self::Launch { .. }
                | Self::StartTimeout { .. }
                | Self::StartFailed { .. }
        )
    }
}

/// Outcome of stopping one feedback.
#[derive(Debug, Clone, PartialEq)]
pub struct StopReport {
    pub name: String,
    pub final_state: FeedbackState,
    /// A forced kill was issued.
    pub killed: bool,
    /// The process was still alive after the kill; kept for diagnostics.
    pub failed_to_stop: bool,
}

/// Handle to one launched feedback.
pub struct FeedbackHandle {
    name: String,
    writer: Option<FramedWrite<ChannelWriter, SignalFrameCodec>>,
    process: Box<dyn FeedbackProcess>,
    reader: JoinHandle<()>,
    state: Arc<watch::Sender<FeedbackState>>,
    kill_requested: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
}

impl FeedbackHandle {
    fn spawn(
        name: &str,
        launched: LaunchedFeedback,
        max_frame_len: usize,
        replies: mpsc::Sender<Signal>,
    ) -> Self {
        let LaunchedFeedback {
            reader,
            writer,
            process,
        } = launched;

        let state = Arc::new(watch::Sender::new(FeedbackState::Created));
        let kill_requested = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));

        let reader_task = ReaderTask {
            name: name.to_string(),
            frames: FramedRead::new(reader, SignalFrameCodec::new(max_frame_len)),
            state: Arc::clone(&state),
            kill_requested: Arc::clone(&kill_requested),
            failure: Arc::clone(&failure),
            replies,
        };

        Self {
            name: name.to_string(),
            writer: Some(FramedWrite::new(writer, SignalFrameCodec::new(max_frame_len))),
            process,
            reader: tokio::spawn(reader_task.run()),
            state,
            kill_requested,
            failure,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FeedbackState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedbackState> {
        self.state.subscribe()
    }

    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    async fn send(&mut self, signal: Signal, timeout: Duration) -> Result<(), SupervisorError> {
        let channel_error = |source| SupervisorError::Channel {
            name: self.name.clone(),
            source,
        };
        let Some(writer) = self.writer.as_mut() else {
            return Err(channel_error(ChannelError::Closed));
        };
        match tokio::time::timeout(timeout, writer.send(signal)).await {
            Ok(result) => result.map_err(|e| channel_error(ChannelError::Io(e))),
            Err(_) => Err(SupervisorError::SendTimeout {
                name: self.name.clone(),
                timeout,
            }),
        }
    }

    /// Deliver STOP + QUIT and close the channel. `false` if the feedback
    /// stopped reading and the write did not finish in time.
    async fn deliver_stop(
        &self,
        mut writer: FramedWrite<ChannelWriter, SignalFrameCodec>,
        timeout: Duration,
    ) -> bool {
        let stop = Signal::command([Command::Stop, Command::Quit], SignalData::new());
        let delivery = async {
            writer.send(stop).await?;
            writer.close().await?;
            Ok::<_, std::io::Error>(())
        };
        match tokio::time::timeout(timeout, delivery).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(feedback = %self.name, error = %e, "Channel already closed");
                true
            }
            Err(_) => {
                tracing::warn!(feedback = %self.name, "Feedback is not reading its channel");
                false
            }
        }
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    async fn wait_for_exit(&mut self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.process.wait()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(feedback = %self.name, error = %e, "Waiting for feedback failed"),
            Err(_) => tracing::warn!(feedback = %self.name, "Feedback did not exit in time"),
        }
    }

    async fn shutdown(mut self, stop_timeout: Duration) -> StopReport {
        let delivered = match self.writer.take() {
            Some(writer) => self.deliver_stop(writer, stop_timeout).await,
            None => true,
        };

        if delivered {
            self.wait_for_exit(stop_timeout).await;
        }

        let mut killed = false;
        if self.process.is_alive() {
            tracing::warn!(feedback = %self.name, pid = ?self.process.id(), "Killing feedback");
            self.kill_requested.store(true, Ordering::SeqCst);
            killed = true;
            if let Err(e) = self.process.start_kill() {
                tracing::warn!(feedback = %self.name, error = %e, "Kill failed");
            }
            self.wait_for_exit(stop_timeout).await;
        }

        let failed_to_stop = self.process.is_alive();
        if failed_to_stop {
            tracing::error!(feedback = %self.name, pid = ?self.process.id(), "Feedback failed to stop, giving up");
        }

        if tokio::time::timeout(stop_timeout, &mut self.reader).await.is_err() {
            tracing::warn!(feedback = %self.name, "Reader did not finish, aborting it");
            self.reader.abort();
            self.state.send_replace(FeedbackState::Terminated);
        }

        let mut final_state = self.state();
        if !final_state.is_final() {
            final_state = FeedbackState::Terminated;
            self.state.send_replace(final_state);
        }

        tracing::info!(feedback = %self.name, state = %final_state, killed, "Feedback stopped");
        StopReport {
            name: self.name,
            final_state,
            killed,
            failed_to_stop,
        }
    }
}

struct ReaderTask {
    name: String,
    frames: FramedRead<ChannelReader, SignalFrameCodec>,
    state: Arc<watch::Sender<FeedbackState>>,
    kill_requested: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
    replies: mpsc::Sender<Signal>,
}

impl ReaderTask {
    async fn run(mut self) {
        loop {
            match self.frames.next().await {
                Some(Ok(signal)) => self.handle(signal).await,
                Some(Err(e)) => {
                    tracing::warn!(feedback = %self.name, error = %e, "Process channel read error");
                    break;
                }
                None => {
                    tracing::debug!(feedback = %self.name, "Process channel closed");
                    break;
                }
            }
        }

        let final_state = if self.kill_requested.load(Ordering::SeqCst) {
            FeedbackState::Terminated
        } else {
            FeedbackState::Stopped
        };
        let previous = self.state.send_replace(final_state);
        tracing::debug!(feedback = %self.name, from = %previous, to = %final_state, "Reader exiting");
    }

    async fn handle(&mut self, signal: Signal) {
        let report = (signal.kind() == SignalKind::Reply)
            .then(|| signal.get(STATE_KEY).and_then(Value::as_str))
            .flatten();

        let Some(report) = report else {
            if self.replies.send(signal).await.is_err() {
                tracing::debug!(feedback = %self.name, "Reply stream closed, dropping reply");
            }
            return;
        };

        if report == FAILED_REPORT {
            let error = signal
                .get(ERROR_KEY)
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            tracing::error!(feedback = %self.name, %error, "Feedback reported failure");
            if let Ok(mut slot) = self.failure.lock() {
                *slot = Some(error);
            }
            return;
        }

        match report.parse::<FeedbackState>() {
            Ok(next) => {
                let previous = self.state.send_replace(next);
                tracing::info!(feedback = %self.name, from = %previous, to = %next, "Feedback state changed");
            }
            Err(e) => tracing::warn!(feedback = %self.name, error = %e, "Ignoring state report"),
        }
    }
}

pub struct FeedbackSupervisor {
    launcher: Arc<dyn FeedbackLauncher>,
    registry: FeedbackRegistry,
    config: SupervisorConfig,
    replies: mpsc::Sender<Signal>,
    handle: Option<FeedbackHandle>,
    last_state: Option<FeedbackState>,
    failed_stops: Vec<String>,
}

impl FeedbackSupervisor {
    pub fn new(
        launcher: Arc<dyn FeedbackLauncher>,
        registry: FeedbackRegistry,
        config: SupervisorConfig,
    ) -> (Self, FeedbackReplies) {
        let (replies, replies_rx) = mpsc::channel(REPLY_BUFFER);
        let supervisor = Self {
            launcher,
            registry,
            config,
            replies,
            handle: None,
            last_state: None,
            failed_stops: Vec::new(),
        };
        (supervisor, replies_rx)
    }

    pub fn registry(&self) -> &FeedbackRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Name of the active feedback.
    pub fn current(&self) -> Option<&str> {
        self.handle.as_ref().map(FeedbackHandle::name)
    }

    /// State of the active feedback, or the final state of the last one.
    pub fn state(&self) -> Option<FeedbackState> {
        self.handle.as_ref().map(FeedbackHandle::state).or(self.last_state)
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<FeedbackState>> {
        self.handle.as_ref().map(FeedbackHandle::subscribe)
    }

    /// Feedbacks that survived a forced kill.
    pub fn failed_stops(&self) -> &[String] {
        &self.failed_stops
    }

    /// Stop the active feedback (if any) and start `name`.
    ///
    /// Returns once the new feedback reported INITIALIZED. On any failure the
    /// new process is torn down and nothing is running.
    pub async fn start_feedback(&mut self, name: &str) -> Result<(), SupervisorError> {
        if let Some(previous) = self.current() {
            tracing::info!(previous, next = name, "Stopping previous feedback");
            self.stop_feedback().await;
        }

        if !self.registry.contains(name) {
            return Err(SupervisorError::UnknownFeedback(
                RegistryError::UnknownFeedback {
                    name: name.to_string(),
                    available: self.registry.names(),
                },
            ));
        }

        tracing::info!(feedback = name, "Starting feedback");
        let launched = self
            .launcher
            .launch(name, self.config.max_frame_len)
            .map_err(|source| SupervisorError::Launch {
                name: name.to_string(),
                source,
            })?;
        let handle = FeedbackHandle::spawn(
            name,
            launched,
            self.config.max_frame_len,
            self.replies.clone(),
        );

        let mut state_rx = handle.subscribe();
        let timeout = self.config.start_timeout;
        let reached = tokio::time::timeout(timeout, async {
            state_rx
                .wait_for(|s| *s != FeedbackState::Created)
                .await
                .map(|s| *s)
                .unwrap_or(FeedbackState::Terminated)
        })
        .await;

        let error = match reached {
            Ok(state) if state.is_running() => {
                tracing::info!(feedback = name, "Feedback initialized");
                self.handle = Some(handle);
                return Ok(());
            }
            Ok(_) => SupervisorError::StartFailed {
                name: name.to_string(),
                reason: handle
                    .failure()
                    .unwrap_or_else(|| "exited before initializing".to_string()),
            },
            Err(_) => SupervisorError::StartTimeout {
                name: name.to_string(),
                timeout,
            },
        };

        tracing::error!(feedback = name, error = %error, "Feedback start failed");
        let report = handle.shutdown(self.config.stop_timeout).await;
        self.record(&report);
        Err(error)
    }

    pub async fn play(&mut self) -> Result<(), SupervisorError> {
        self.command(Command::Play).await
    }

    pub async fn pause(&mut self) -> Result<(), SupervisorError> {
        self.command(Command::Pause).await
    }

    async fn command(&mut self, cmd: Command) -> Result<(), SupervisorError> {
        self.send(Signal::command([cmd], SignalData::new())).await
    }

    /// Forward a signal to the active feedback.
    ///
    /// A feedback that does not accept the signal within `send_timeout` is
    /// stuck and gets torn down.
    pub async fn send(&mut self, signal: Signal) -> Result<(), SupervisorError> {
        let handle = self.handle.as_mut().ok_or(SupervisorError::NotRunning)?;
        let result = handle.send(signal, self.config.send_timeout).await;
        if let Err(e @ SupervisorError::SendTimeout { .. }) = &result {
            tracing::error!(error = %e, "Feedback is stuck, stopping it");
            self.stop_feedback().await;
        }
        result
    }

    /// Stop the active feedback. `None` if nothing was running.
    pub async fn stop_feedback(&mut self) -> Option<StopReport> {
        let handle = self.handle.take()?;
        tracing::info!(feedback = handle.name(), "Stopping feedback");
        let report = handle.shutdown(self.config.stop_timeout).await;
        self.record(&report);
        Some(report)
    }

    /// Tear down the active feedback if its process died or it already
    /// reached a final state on its own.
    pub async fn reap(&mut self) -> Option<StopReport> {
        let handle = self.handle.as_mut()?;
        if handle.is_alive() && !handle.state().is_final() {
            return None;
        }
        tracing::warn!(feedback = handle.name(), state = %handle.state(), "Feedback process is gone");
        self.stop_feedback().await
    }

    fn record(&mut self, report: &StopReport) {
        self.last_state = Some(report.final_state);
        if report.failed_to_stop {
            self.failed_stops.push(report.name.clone());
        }
    }
}
