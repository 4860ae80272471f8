//! Feedback-side runtime.
//!
//! Runs one feedback behind the process channel: creates it from the registry,
//! runs `on_init`, reports lifecycle states back to the controller and then
//! dispatches inbound signals until QUIT or end-of-stream.
//!
//! Two tasks share the feedback:
//! - the dispatch loop (this function) decodes signals, applies lifecycle
//!   commands and calls the event hooks
//! - the play task calls `on_play` once per transition into PLAYING, so a
//!   long-running play routine never blocks control events
//!
//! Reports are reply signals carrying `_state` (and `_error` on failure).

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::task::AbortOnDropHandle;

use crate::bridge::{ChannelError, SignalFrameCodec};
use crate::feedback::{Feedback, FeedbackRegistry, HandlerFault, RegistryError, invoke_hook};
use crate::signal::{
    Command, ERROR_KEY, RequestId, STATE_KEY, Signal, SignalData, SignalKind, VARIABLES_KEY,
};
use crate::state::FeedbackState;

/// `_state` value sent when the feedback could not be created or initialized.
pub const FAILED_REPORT: &str = "failed";

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("feedback failed to initialize: {0}")]
    Init(#[source] HandlerFault),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Run the feedback `name` over `reader`/`writer` until it quits or the
/// controller closes the channel.
pub async fn run_feedback_worker<R, W>(
    registry: &FeedbackRegistry,
    name: &str,
    reader: R,
    writer: W,
    max_frame_len: usize,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut frames_in = FramedRead::new(reader, SignalFrameCodec::new(max_frame_len));
    let mut frames_out = FramedWrite::new(writer, SignalFrameCodec::new(max_frame_len));

    tracing::info!(feedback = name, "Worker starting feedback");

    let feedback = match registry.create(name) {
        Ok(fb) => fb,
        Err(e) => {
            tracing::error!(error = %e, "Cannot create feedback");
            report_failure(&mut frames_out, &e.to_string()).await;
            return Err(e.into());
        }
    };

    if let Err(fault) = invoke_hook("on_init", feedback.on_init()).await {
        log_fault(&fault);
        report_failure(&mut frames_out, &fault.to_string()).await;
        return Err(WorkerError::Init(fault));
    }

    let mut worker = FeedbackWorker::new(feedback, frames_out);
    worker.report(FeedbackState::Initialized).await?;
    tracing::info!(feedback = name, "Feedback initialized");

    let result = loop {
        match frames_in.next().await {
            Some(Ok(signal)) => match worker.dispatch(signal).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => {
                    tracing::info!(feedback = name, "Quit requested");
                    break Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to write to process channel");
                    break Err(e);
                }
            },
            Some(Err(e)) => {
                // FramedRead yields nothing after an error, so the channel is done.
                tracing::error!(error = %e, "Process channel read error");
                break Err(ChannelError::Io(e));
            }
            None => {
                tracing::info!(feedback = name, "Process channel closed, exiting");
                break Ok(());
            }
        }
    };

    worker.finish().await;
    result.map_err(Into::into)
}

async fn report_failure<W>(frames: &mut FramedWrite<W, SignalFrameCodec>, error: &str)
where
    W: AsyncWrite + Unpin,
{
    let mut data = SignalData::new();
    data.insert(STATE_KEY.to_string(), json!(FAILED_REPORT));
    data.insert(ERROR_KEY.to_string(), json!(error));
    if let Err(e) = frames.send(Signal::reply(data)).await {
        tracing::warn!(error = %e, "Failed to report start failure");
    }
}

fn log_fault(fault: &HandlerFault) {
    tracing::error!(
        target: "fbcontrol::feedback",
        hook = fault.hook(),
        error = ?fault,
        "Feedback hook failed"
    );
}

/// Keys sent by older GUIs are dotted paths (`"obj.attr"`); feedbacks see the
/// last segment only.
fn normalize_interaction_keys(data: &SignalData) -> SignalData {
    data.iter()
        .map(|(k, v)| {
            let key = k.rsplit('.').next().unwrap_or(k);
            (key.to_string(), v.clone())
        })
        .collect()
}

struct FeedbackWorker<W> {
    feedback: Arc<dyn Feedback>,
    frames: FramedWrite<W, SignalFrameCodec>,
    state: FeedbackState,
    play_tx: mpsc::UnboundedSender<()>,
    play_task: AbortOnDropHandle<()>,
}

impl<W> FeedbackWorker<W>
where
    W: AsyncWrite + Unpin,
{
    fn new(feedback: Arc<dyn Feedback>, frames: FramedWrite<W, SignalFrameCodec>) -> Self {
        let (play_tx, play_task) = spawn_play_task(Arc::clone(&feedback));
        Self {
            feedback,
            frames,
            state: FeedbackState::Initialized,
            play_tx,
            play_task,
        }
    }

    async fn report(&mut self, state: FeedbackState) -> Result<(), ChannelError> {
        let mut data = SignalData::new();
        data.insert(STATE_KEY.to_string(), json!(state.as_str()));
        self.frames.send(Signal::reply(data)).await?;
        Ok(())
    }

    async fn dispatch(&mut self, signal: Signal) -> Result<Flow, ChannelError> {
        match signal.kind() {
            SignalKind::Control => {
                self.control_event(signal.data()).await;
                Ok(Flow::Continue)
            }
            SignalKind::Interaction => {
                self.interaction_event(signal.data()).await;
                Ok(Flow::Continue)
            }
            SignalKind::Reply => {
                tracing::warn!("Ignoring reply signal sent to feedback");
                Ok(Flow::Continue)
            }
            SignalKind::Command => {
                let lifecycle_only = signal.commands().iter().all(Command::is_lifecycle)
                    && signal.data().is_empty();
                if !lifecycle_only {
                    self.interaction_event(signal.data()).await;
                }
                for &cmd in signal.commands() {
                    if self.apply(cmd, signal.request_id()).await? == Flow::Exit {
                        return Ok(Flow::Exit);
                    }
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn control_event(&self, data: &SignalData) {
        if let Err(fault) =
            invoke_hook("on_control_event", self.feedback.on_control_event(data)).await
        {
            log_fault(&fault);
        }
    }

    async fn interaction_event(&self, data: &SignalData) {
        let data = normalize_interaction_keys(data);
        if let Err(fault) =
            invoke_hook("on_interaction_event", self.feedback.on_interaction_event(&data)).await
        {
            log_fault(&fault);
        }
    }

    async fn hook(&self, cmd: Command) {
        let result = match cmd {
            Command::Pause => invoke_hook("on_pause", self.feedback.on_pause()).await,
            Command::Stop => invoke_hook("on_stop", self.feedback.on_stop()).await,
            Command::Quit => invoke_hook("on_quit", self.feedback.on_quit()).await,
            _ => Ok(()),
        };
        if let Err(fault) = result {
            log_fault(&fault);
        }
    }

    async fn apply(
        &mut self,
        cmd: Command,
        request_id: Option<RequestId>,
    ) -> Result<Flow, ChannelError> {
        match cmd {
            Command::Play => match self.state {
                FeedbackState::Initialized | FeedbackState::Paused => {
                    self.state = FeedbackState::Playing;
                    if self.play_tx.send(()).is_err() {
                        tracing::error!("Play task is gone, on_play will not run");
                    }
                    self.report(FeedbackState::Playing).await?;
                }
                FeedbackState::Playing => tracing::debug!("Already playing, ignoring play"),
                state => tracing::warn!(%state, "Ignoring play"),
            },
            Command::Pause => {
                if self.state == FeedbackState::Playing {
                    self.hook(cmd).await;
                    self.state = FeedbackState::Paused;
                    self.report(FeedbackState::Paused).await?;
                } else {
                    tracing::debug!(state = %self.state, "Not playing, ignoring pause");
                }
            }
            Command::Stop => {
                if self.state == FeedbackState::Stopped {
                    tracing::debug!("Already stopped, ignoring stop");
                } else {
                    self.hook(cmd).await;
                    self.state = FeedbackState::Stopped;
                    self.report(FeedbackState::Stopped).await?;
                }
            }
            Command::Quit => {
                self.hook(cmd).await;
                return Ok(Flow::Exit);
            }
            Command::GetVariables => {
                let mut data = SignalData::new();
                data.insert(VARIABLES_KEY.to_string(), Value::Object(self.variables()));
                self.reply(data, request_id).await?;
            }
            Command::GetFeedbacks | Command::SendInit | Command::QuitController => {
                tracing::debug!(command = %cmd, "Controller command reached feedback, ignoring");
            }
        }
        Ok(Flow::Continue)
    }

    /// Answer a request. A reply the codec refuses, e.g. one over the frame
    /// limit, is answered with `_error` instead; only I/O failures end the
    /// worker.
    async fn reply(
        &mut self,
        data: SignalData,
        request_id: Option<RequestId>,
    ) -> Result<(), ChannelError> {
        let correlate = |signal: Signal| match request_id {
            Some(id) => signal.with_request_id(id),
            None => signal,
        };
        match self.frames.send(correlate(Signal::reply(data))).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::error!(error = %e, "Reply cannot be encoded, answering with an error");
                let mut data = SignalData::new();
                data.insert(ERROR_KEY.to_string(), json!(e.to_string()));
                self.frames.send(correlate(Signal::reply(data))).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn variables(&self) -> SignalData {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.feedback.variables())) {
            Ok(vars) => vars,
            Err(_) => {
                log_fault(&HandlerFault::Panicked {
                    hook: "variables",
                    message: "variables() panicked".to_string(),
                });
                SignalData::new()
            }
        }
    }

    async fn finish(mut self) {
        drop(self.play_tx);
        self.play_task.abort();
        if let Err(e) = self.play_task.await
            && e.is_panic()
        {
            tracing::error!("Play task panicked");
        }
        if let Err(e) = self.frames.close().await {
            tracing::debug!(error = %e, "Process channel already closed");
        }
    }
}

/// The play task dies with its handle, so a killed worker takes `on_play` with it.
fn spawn_play_task(
    feedback: Arc<dyn Feedback>,
) -> (mpsc::UnboundedSender<()>, AbortOnDropHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let task = tokio::spawn(async move {
        while rx.recv().await.is_some() {
            tracing::debug!("Invoking on_play");
            if let Err(fault) = invoke_hook("on_play", feedback.on_play()).await {
                log_fault(&fault);
            }
        }
    });
    (tx, AbortOnDropHandle::new(task))
}
