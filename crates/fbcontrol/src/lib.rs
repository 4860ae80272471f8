//! fbcontrol: signal transport and feedback process supervision for BCI
//! feedback controllers.

mod state;

pub mod bridge;
pub mod config;
pub mod controller;
pub mod feedback;
pub mod launcher;
pub mod signal;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use bridge::{DecodeError, EncodeError, SignalCodec, decode, encode};
pub use config::{ConfigError, ControllerConfig, NetworkConfig, SupervisorConfig};
pub use controller::{ControllerError, ControllerHandle, FeedbackController};
pub use feedback::{Feedback, FeedbackRegistry, HandlerFault, RegistryError};
pub use launcher::{
    FeedbackLauncher, FeedbackProcess, InProcessLauncher, LaunchError, SubprocessLauncher,
};
pub use signal::{Command, RequestId, Signal, SignalData, SignalKind};
pub use state::FeedbackState;
pub use supervisor::{FeedbackSupervisor, StopReport, SupervisorError};
pub use transport::{ControllerClient, TransportError, UdpTransport};
pub use worker::{WorkerError, run_feedback_worker};
