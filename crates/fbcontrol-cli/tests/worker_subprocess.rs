//! Feedbacks hosted by the `fbcontrol worker` subprocess over stdin/stdout.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_util::codec::{FramedRead, FramedWrite};

use fbcontrol::bridge::{DEFAULT_MAX_FRAME_LEN, SignalFrameCodec};
use fbcontrol::launcher::{ChannelReader, LaunchedFeedback};
use fbcontrol::signal::{STATE_KEY, VARIABLES_KEY, data};
use fbcontrol::{
    Command, FeedbackLauncher, FeedbackRegistry, FeedbackState, FeedbackSupervisor, RequestId,
    Signal, SignalData, SubprocessLauncher, SupervisorConfig,
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

fn launcher() -> SubprocessLauncher {
    SubprocessLauncher::new(env!("CARGO_BIN_EXE_fbcontrol")).arg("worker")
}

fn get_variables(id: RequestId) -> Signal {
    Signal::command([Command::GetVariables], SignalData::new()).with_request_id(id)
}

async fn recv(rx: &mut FramedRead<ChannelReader, SignalFrameCodec>) -> Signal {
    tokio::time::timeout(REPLY_TIMEOUT, rx.next())
        .await
        .expect("worker answered in time")
        .expect("channel open")
        .expect("valid frame")
}

#[tokio::test]
async fn worker_speaks_framed_signals_on_stdio() {
    let LaunchedFeedback {
        reader,
        writer,
        mut process,
    } = launcher()
        .launch("TrivialFeedback", DEFAULT_MAX_FRAME_LEN)
        .unwrap();
    assert!(process.id().is_some());

    let mut rx = FramedRead::new(reader, SignalFrameCodec::default());
    let mut tx = FramedWrite::new(writer, SignalFrameCodec::default());

    assert_eq!(recv(&mut rx).await.get(STATE_KEY), Some(&json!("initialized")));

    tx.send(Signal::command([Command::Play], SignalData::new()))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await.get(STATE_KEY), Some(&json!("playing")));

    tx.send(Signal::control(data([("data", json!(42))])))
        .await
        .unwrap();
    let id = RequestId::new();
    tx.send(get_variables(id)).await.unwrap();
    let reply = recv(&mut rx).await;
    assert_eq!(reply.request_id(), Some(id));
    let vars = reply.get(VARIABLES_KEY).unwrap();
    assert_eq!(vars["data"], json!(42));

    tx.send(Signal::command([Command::Stop, Command::Quit], SignalData::new()))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await.get(STATE_KEY), Some(&json!("stopped")));

    tokio::time::timeout(REPLY_TIMEOUT, process.wait())
        .await
        .expect("worker exited in time")
        .unwrap();
    assert!(!process.is_alive());
    assert!(rx.next().await.is_none());
}

#[tokio::test]
async fn supervisor_drives_subprocess_feedback_to_stopped() {
    let config = SupervisorConfig::default()
        .with_start_timeout(REPLY_TIMEOUT)
        .with_stop_timeout(Duration::from_secs(5));
    let (mut sup, mut replies) =
        FeedbackSupervisor::new(Arc::new(launcher()), FeedbackRegistry::with_builtin(), config);

    sup.start_feedback("Timer").await.unwrap();
    assert_eq!(sup.state(), Some(FeedbackState::Initialized));

    let mut state = sup.subscribe().unwrap();
    sup.play().await.unwrap();
    tokio::time::timeout(REPLY_TIMEOUT, state.wait_for(|s| *s == FeedbackState::Playing))
        .await
        .expect("playing in time")
        .unwrap();

    let elapsed = tokio::time::timeout(REPLY_TIMEOUT, async {
        loop {
            let id = RequestId::new();
            sup.send(get_variables(id)).await.unwrap();
            let reply = replies.recv().await.unwrap();
            assert_eq!(reply.request_id(), Some(id));
            if let Some(elapsed) = reply
                .get(VARIABLES_KEY)
                .and_then(|vars| vars.get("elapsed"))
                .and_then(Value::as_f64)
            {
                return elapsed;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert!(elapsed >= 0.0);

    let report = sup.stop_feedback().await.unwrap();
    assert_eq!(report.final_state, FeedbackState::Stopped);
    assert!(!report.killed);
    assert!(!report.failed_to_stop);
    assert!(sup.current().is_none());
    assert!(sup.failed_stops().is_empty());
}
