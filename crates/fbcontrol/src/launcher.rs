//! Ways to bring up a feedback process and its duplex channel.
//!
//! The supervisor only needs a reader, a writer and something it can check and
//! kill. [`SubprocessLauncher`] runs the feedback in a child process talking
//! over its stdin/stdout; [`InProcessLauncher`] runs the same worker runtime on
//! a tokio task over an in-memory pipe.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::feedback::FeedbackRegistry;
use crate::worker::run_feedback_worker;

pub type ChannelReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn feedback process: {0}")]
    Spawn(#[from] io::Error),

    #[error("feedback process {0} not captured")]
    MissingPipe(&'static str),
}

/// Liveness and teardown of a launched feedback.
#[async_trait::async_trait]
pub trait FeedbackProcess: Send + Sync {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Request termination without waiting for it.
    fn start_kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit. Cancel safe.
    async fn wait(&mut self) -> io::Result<()>;
}

pub struct LaunchedFeedback {
    pub reader: ChannelReader,
    pub writer: ChannelWriter,
    pub process: Box<dyn FeedbackProcess>,
}

/// Extension point for different feedback launch strategies.
pub trait FeedbackLauncher: Send + Sync {
    fn launch(&self, name: &str, max_frame_len: usize) -> Result<LaunchedFeedback, LaunchError>;
}

/// Runs `<program> <args..> <name> --max-frame-len <n>` with piped stdin/stdout.
///
/// stderr is inherited so the child's logs land next to the controller's.
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl SubprocessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-run the current executable with its `worker` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl FeedbackLauncher for SubprocessLauncher {
    fn launch(&self, name: &str, max_frame_len: usize) -> Result<LaunchedFeedback, LaunchError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(name)
            .arg("--max-frame-len")
            .arg(max_frame_len.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe("stdout"))?;

        tracing::info!(feedback = name, pid = ?child.id(), "Spawned feedback process");
        Ok(LaunchedFeedback {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(ChildProcess(child)),
        })
    }
}

struct ChildProcess(Child);

#[async_trait::async_trait]
impl FeedbackProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.0.try_wait(), Ok(None))
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.0.start_kill()
    }

    async fn wait(&mut self) -> io::Result<()> {
        let status = self.0.wait().await?;
        tracing::debug!(%status, "Feedback process exited");
        Ok(())
    }
}

/// Runs the worker runtime on a tokio task. Must be called inside a runtime.
#[derive(Debug, Clone)]
pub struct InProcessLauncher {
    registry: FeedbackRegistry,
    pipe_capacity: usize,
}

impl InProcessLauncher {
    pub fn new(registry: FeedbackRegistry) -> Self {
        Self {
            registry,
            pipe_capacity: 64 * 1024,
        }
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }
}

impl FeedbackLauncher for InProcessLauncher {
    fn launch(&self, name: &str, max_frame_len: usize) -> Result<LaunchedFeedback, LaunchError> {
        let (controller_side, worker_side) = tokio::io::duplex(self.pipe_capacity);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (read, write) = tokio::io::split(controller_side);

        let registry = self.registry.clone();
        let feedback = name.to_string();
        let task = tokio::spawn(async move {
            if let Err(e) =
                run_feedback_worker(&registry, &feedback, worker_read, worker_write, max_frame_len)
                    .await
            {
                tracing::warn!(feedback = %feedback, error = %e, "In-process feedback exited with error");
            }
        });

        tracing::info!(feedback = name, "Started in-process feedback");
        Ok(LaunchedFeedback {
            reader: Box::new(read),
            writer: Box::new(write),
            process: Box::new(TaskProcess {
                task,
                reaped: false,
            }),
        })
    }
}

struct TaskProcess {
    task: JoinHandle<()>,
    reaped: bool,
}

#[async_trait::async_trait]
impl FeedbackProcess for TaskProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        !self.reaped && !self.task.is_finished()
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.task.abort();
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<()> {
        // A JoinHandle must not be polled again once it has completed.
        if self.reaped {
            return Ok(());
        }
        let result = (&mut self.task).await;
        self.reaped = true;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{DEFAULT_MAX_FRAME_LEN, SignalFrameCodec};
    use crate::signal::{Command, STATE_KEY, Signal, SignalData};
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn in_process_feedback_initializes_and_quits() {
        let launcher = InProcessLauncher::new(FeedbackRegistry::with_builtin());
        let LaunchedFeedback {
            reader,
            writer,
            mut process,
        } = launcher.launch("Timer", DEFAULT_MAX_FRAME_LEN).unwrap();
        assert!(process.id().is_none());

        let mut rx = FramedRead::new(reader, SignalFrameCodec::default());
        let mut tx = FramedWrite::new(writer, SignalFrameCodec::default());

        let report = rx.next().await.unwrap().unwrap();
        assert_eq!(report.get(STATE_KEY), Some(&json!("initialized")));
        assert!(process.is_alive());

        tx.send(Signal::command([Command::Quit], SignalData::new()))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), process.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn killed_task_reports_dead() {
        let launcher = InProcessLauncher::new(FeedbackRegistry::with_builtin());
        let mut launched = launcher.launch("Timer", DEFAULT_MAX_FRAME_LEN).unwrap();

        launched.process.start_kill().unwrap();
        tokio::time::timeout(Duration::from_secs(2), launched.process.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!launched.process.is_alive());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let launcher = SubprocessLauncher::new("/nonexistent/fbcontrol-worker").arg("worker");
        let err = launcher.launch("Timer", DEFAULT_MAX_FRAME_LEN).err().unwrap();
        assert!(matches!(err, LaunchError::Spawn(_)));
    }
}
