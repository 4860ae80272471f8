//! Feedback hook set, handler fault capture and the name → factory registry.
//!
//! A feedback is the stimulus/task side of an experiment. It runs inside its
//! own process (see [`crate::worker`]) and only ever sees the hooks below; the
//! controller never calls into it directly.

pub mod builtin;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::signal::SignalData;

pub use builtin::{BenchmarkFeedback, Timer, TrivialFeedback};

/// Hooks invoked by the worker runtime.
///
/// `on_play` runs on the worker's play task and may take as long as it likes;
/// every other hook runs on the dispatch task and should return promptly.
/// Errors and panics from any hook are captured as [`HandlerFault`]s and never
/// stop the dispatch loop.
#[async_trait::async_trait]
pub trait Feedback: Send + Sync + 'static {
    async fn on_init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_play(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_pause(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_quit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_control_event(&self, _data: &SignalData) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_interaction_event(&self, _data: &SignalData) -> anyhow::Result<()> {
        Ok(())
    }

    /// Snapshot answered to `getvariables`.
    fn variables(&self) -> SignalData {
        SignalData::new()
    }
}

/// A hook returned an error or panicked.
#[derive(Debug, thiserror::Error)]
pub enum HandlerFault {
    #[error("{hook} returned an error: {source:#}")]
    Failed {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{hook} panicked: {message}")]
    Panicked { hook: &'static str, message: String },
}

impl HandlerFault {
    pub fn hook(&self) -> &'static str {
        match self {
            Self::Failed { hook, .. } | Self::Panicked { hook, .. } => hook,
        }
    }
}

/// Await a hook future, turning errors and panics into a [`HandlerFault`].
pub async fn invoke_hook<F>(hook: &'static str, fut: F) -> Result<(), HandlerFault>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(HandlerFault::Failed { hook, source }),
        Err(payload) => Err(HandlerFault::Panicked {
            hook,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown feedback {name:?} (available: {})", available.join(", "))]
    UnknownFeedback {
        name: String,
        available: Vec<String>,
    },
}

pub type FeedbackFactory = Arc<dyn Fn() -> Arc<dyn Feedback> + Send + Sync>;

/// Ordered map from feedback name to factory.
///
/// Order is registration order and is what `getfeedbacks` reports.
#[derive(Clone, Default)]
pub struct FeedbackRegistry {
    entries: Vec<(String, FeedbackFactory)>,
}

impl FeedbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the feedbacks shipped with this crate.
    pub fn with_builtin() -> Self {
        Self::new()
            .with("BenchmarkFeedback", || Arc::new(BenchmarkFeedback::default()))
            .with("Timer", || Arc::new(Timer::default()))
            .with("TrivialFeedback", || Arc::new(TrivialFeedback::default()))
    }

    /// Register `factory` under `name`. Re-registering a name replaces the
    /// factory and keeps its position.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Feedback> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory: FeedbackFactory = Arc::new(factory);
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((name, factory)),
        }
    }

    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Feedback> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn Feedback>, RegistryError> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, factory)| factory())
            .ok_or_else(|| RegistryError::UnknownFeedback {
                name: name.to_string(),
                available: self.names(),
            })
    }
}

impl fmt::Debug for FeedbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Faulty;

    #[async_trait::async_trait]
    impl Feedback for Faulty {
        async fn on_control_event(&self, _data: &SignalData) -> anyhow::Result<()> {
            anyhow::bail!("bad sample")
        }

        async fn on_interaction_event(&self, _data: &SignalData) -> anyhow::Result<()> {
            panic!("interaction exploded")
        }
    }

    #[tokio::test]
    async fn error_becomes_fault() {
        let fb = Faulty;
        let data = SignalData::new();
        let fault = invoke_hook("on_control_event", fb.on_control_event(&data))
            .await
            .unwrap_err();
        assert_eq!(fault.hook(), "on_control_event");
        assert!(fault.to_string().contains("bad sample"));
    }

    #[tokio::test]
    async fn panic_becomes_fault() {
        let fb = Faulty;
        let data = SignalData::new();
        let fault = invoke_hook("on_interaction_event", fb.on_interaction_event(&data))
            .await
            .unwrap_err();
        assert!(matches!(
            fault,
            HandlerFault::Panicked { ref message, .. } if message == "interaction exploded"
        ));
    }

    #[tokio::test]
    async fn default_hooks_succeed() {
        let fb = Faulty;
        invoke_hook("on_play", fb.on_play()).await.unwrap();
        assert!(fb.variables().is_empty());
    }

    #[test]
    fn builtin_registry_order() {
        let registry = FeedbackRegistry::with_builtin();
        assert_eq!(
            registry.names(),
            vec!["BenchmarkFeedback", "Timer", "TrivialFeedback"]
        );
        assert!(registry.contains("Timer"));
        assert!(registry.create("Timer").is_ok());
    }

    #[test]
    fn unknown_name_is_typed_error() {
        let registry = FeedbackRegistry::with_builtin();
        let err = registry.create("Pong").err().unwrap();
        let RegistryError::UnknownFeedback { name, available } = &err;
        assert_eq!(name, "Pong");
        assert_eq!(available.len(), 3);
        assert!(err.to_string().contains("Pong"));
    }

    #[test]
    fn re_registering_keeps_position() {
        let registry = FeedbackRegistry::with_builtin().with("BenchmarkFeedback", || Arc::new(Faulty));
        assert_eq!(registry.names()[0], "BenchmarkFeedback");
        assert_eq!(registry.names().len(), 3);
    }
}
