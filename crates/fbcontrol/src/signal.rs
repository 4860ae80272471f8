//! Signal value type exchanged between clients, the controller and feedbacks.
//!
//! A [`Signal`] is immutable once built. Constructors enforce that commands are
//! present if and only if the kind is [`SignalKind::Command`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Payload carried by a signal: string keys to arbitrary JSON values.
pub type SignalData = serde_json::Map<String, serde_json::Value>;

/// Data key naming the feedback to load for `sendinit`.
pub const FEEDBACK_KEY: &str = "_feedback";
/// Key older clients used for the same purpose.
pub const LEGACY_FEEDBACK_KEY: &str = "feedback";
/// Data key for lifecycle reports sent by the feedback process.
pub const STATE_KEY: &str = "_state";
/// Data key for the error message attached to a failed lifecycle report.
pub const ERROR_KEY: &str = "_error";
/// Reply key listing the available feedbacks.
pub const FEEDBACKS_KEY: &str = "feedbacks";
/// Reply key holding the feedback's variables.
pub const VARIABLES_KEY: &str = "variables";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Interaction signal carrying one or more commands.
    Command,
    /// Interaction event for the running feedback (GUI, parameter changes).
    Interaction,
    /// Control event, usually classifier output or raw data tuples.
    Control,
    /// Answer flowing back towards a client, or a lifecycle report.
    Reply,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Interaction => "interaction",
            Self::Control => "control",
            Self::Reply => "reply",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command tokens understood by the controller and the feedback process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    GetFeedbacks,
    Play,
    Pause,
    Stop,
    Quit,
    SendInit,
    GetVariables,
    QuitController,
}

impl Command {
    /// Wire token for this command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetFeedbacks => "getfeedbacks",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Quit => "quit",
            Self::SendInit => "sendinit",
            Self::GetVariables => "getvariables",
            Self::QuitController => "quitfeedbackcontroller",
        }
    }

    /// Commands that only drive the lifecycle and carry no event payload.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Play | Self::Pause | Self::Stop | Self::Quit)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command token: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "getfeedbacks" => Ok(Self::GetFeedbacks),
            "play" => Ok(Self::Play),
            "pause" => Ok(Self::Pause),
            "stop" => Ok(Self::Stop),
            "quit" => Ok(Self::Quit),
            "sendinit" => Ok(Self::SendInit),
            "getvariables" => Ok(Self::GetVariables),
            "quitfeedbackcontroller" => Ok(Self::QuitController),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// Correlation token attached to requests that expect a reply.
///
/// Legacy peers never send one and ignore it when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds since the UNIX epoch, microsecond resolution.
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    kind: SignalKind,
    commands: Vec<Command>,
    data: SignalData,
    timestamp: Option<f64>,
    request_id: Option<RequestId>,
}

impl Signal {
    /// Command signal. An empty command list degrades to a plain interaction signal.
    pub fn command(commands: impl Into<Vec<Command>>, data: SignalData) -> Self {
        let commands = commands.into();
        let kind = if commands.is_empty() {
            SignalKind::Interaction
        } else {
            SignalKind::Command
        };
        Self::raw(kind, commands, data)
    }

    pub fn interaction(data: SignalData) -> Self {
        Self::raw(SignalKind::Interaction, Vec::new(), data)
    }

    pub fn control(data: SignalData) -> Self {
        Self::raw(SignalKind::Control, Vec::new(), data)
    }

    pub fn reply(data: SignalData) -> Self {
        Self::raw(SignalKind::Reply, Vec::new(), data)
    }

    fn raw(kind: SignalKind, commands: Vec<Command>, data: SignalData) -> Self {
        Self {
            kind,
            commands,
            data,
            timestamp: None,
            request_id: None,
        }
    }

    /// Rebuild from decoded parts. Callers must uphold the command/kind invariant.
    pub(crate) fn from_parts(
        kind: SignalKind,
        commands: Vec<Command>,
        data: SignalData,
        timestamp: Option<f64>,
        request_id: Option<RequestId>,
    ) -> Self {
        debug_assert_eq!(kind == SignalKind::Command, !commands.is_empty());
        Self {
            kind,
            commands,
            data,
            timestamp,
            request_id,
        }
    }

    /// Attach a creation timestamp of "now".
    pub fn stamped(self) -> Self {
        self.with_timestamp(now_timestamp())
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// First command, which decides how the controller routes the signal.
    pub fn first_command(&self) -> Option<Command> {
        self.commands.first().copied()
    }

    pub fn data(&self) -> &SignalData {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    /// Feedback name requested by a `sendinit` command.
    pub fn feedback_name(&self) -> Option<&str> {
        self.get(FEEDBACK_KEY)
            .or_else(|| self.get(LEGACY_FEEDBACK_KEY))
            .and_then(|v| v.as_str())
    }
}

/// Build a [`SignalData`] map from key/value pairs.
///
/// ```
/// let data = fbcontrol::signal::data([("x", serde_json::json!(1))]);
/// assert_eq!(data["x"], 1);
/// ```
pub fn data<K, I>(entries: I) -> SignalData
where
    K: Into<String>,
    I: IntoIterator<Item = (K, serde_json::Value)>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_constructor_sets_kind() {
        let s = Signal::command([Command::Play], SignalData::new());
        assert_eq!(s.kind(), SignalKind::Command);
        assert_eq!(s.first_command(), Some(Command::Play));
    }

    #[test]
    fn empty_command_list_is_interaction() {
        let s = Signal::command(Vec::new(), SignalData::new());
        assert_eq!(s.kind(), SignalKind::Interaction);
        assert!(s.commands().is_empty());
    }

    #[test]
    fn non_command_kinds_have_no_commands() {
        for s in [
            Signal::interaction(SignalData::new()),
            Signal::control(SignalData::new()),
            Signal::reply(SignalData::new()),
        ] {
            assert!(s.commands().is_empty());
            assert_ne!(s.kind(), SignalKind::Command);
        }
    }

    #[test]
    fn command_tokens_parse_back() {
        let all = [
            Command::GetFeedbacks,
            Command::Play,
            Command::Pause,
            Command::Stop,
            Command::Quit,
            Command::SendInit,
            Command::GetVariables,
            Command::QuitController,
        ];
        for cmd in all {
            assert_eq!(cmd.as_str().parse::<Command>().unwrap(), cmd);
        }
        assert!("dance".parse::<Command>().is_err());
    }

    #[test]
    fn feedback_name_prefers_new_key() {
        let s = Signal::command(
            [Command::SendInit],
            data([("_feedback", json!("Timer")), ("feedback", json!("Old"))]),
        );
        assert_eq!(s.feedback_name(), Some("Timer"));

        let legacy = Signal::command([Command::SendInit], data([("feedback", json!("Old"))]));
        assert_eq!(legacy.feedback_name(), Some("Old"));
    }

    #[test]
    fn stamped_sets_recent_timestamp() {
        let before = now_timestamp();
        let s = Signal::control(SignalData::new()).stamped();
        let ts = s.timestamp().unwrap();
        assert!(ts >= before);
        assert!(ts - before < 5.0);
    }
}
