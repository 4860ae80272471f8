//! Feedbacks shipped with the controller.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::{Value, json};

use super::Feedback;
use crate::signal::{SignalData, now_timestamp};

/// Records `(id, sent, received)` for every control signal carrying a
/// `"tuple": [id, sent]` entry. Used by `fbcontrol bench` to measure
/// controller-to-feedback latency.
#[derive(Debug, Default)]
pub struct BenchmarkFeedback {
    samples: Mutex<Vec<(Value, f64, f64)>>,
}

impl BenchmarkFeedback {
    pub fn samples(&self) -> Vec<(Value, f64, f64)> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Feedback for BenchmarkFeedback {
    async fn on_init(&self) -> anyhow::Result<()> {
        if let Ok(mut samples) = self.samples.lock() {
            samples.clear();
        }
        Ok(())
    }

    async fn on_control_event(&self, data: &SignalData) -> anyhow::Result<()> {
        let received = now_timestamp();
        let tuple = data
            .get("tuple")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("control signal has no \"tuple\" entry"))?;
        let [id, sent] = tuple.as_slice() else {
            anyhow::bail!("expected [id, sent], got {} elements", tuple.len());
        };
        let sent = sent
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("sent time is not a number: {sent}"))?;

        self.samples
            .lock()
            .map_err(|_| anyhow::anyhow!("sample buffer poisoned"))?
            .push((id.clone(), sent, received));
        Ok(())
    }

    fn variables(&self) -> SignalData {
        let data: Vec<Value> = self
            .samples()
            .into_iter()
            .map(|(id, sent, received)| json!([id, sent, received]))
            .collect();
        let mut vars = SignalData::new();
        vars.insert("data".to_string(), Value::Array(data));
        vars
    }
}

/// Times an idle loop each time it is played.
#[derive(Debug)]
pub struct Timer {
    iterations: u64,
    elapsed: Mutex<Option<f64>>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl Timer {
    pub fn new(iterations: u64) -> Self {
        Self {
            iterations,
            elapsed: Mutex::new(None),
        }
    }

    fn idle_loop(&self) -> f64 {
        let started = Instant::now();
        for i in 0..self.iterations {
            std::hint::black_box(i);
        }
        started.elapsed().as_secs_f64()
    }
}

#[async_trait::async_trait]
impl Feedback for Timer {
    async fn on_play(&self) -> anyhow::Result<()> {
        let elapsed = self.idle_loop();
        tracing::info!(iterations = self.iterations, elapsed_s = elapsed, "Idle loop finished");
        if let Ok(mut slot) = self.elapsed.lock() {
            *slot = Some(elapsed);
        }
        Ok(())
    }

    fn variables(&self) -> SignalData {
        let elapsed = self.elapsed.lock().ok().and_then(|e| *e);
        let mut vars = SignalData::new();
        vars.insert("iterations".to_string(), json!(self.iterations));
        vars.insert("elapsed".to_string(), json!(elapsed));
        vars
    }
}

/// Keeps the last control value and logs where it would be drawn while
/// playing.
#[derive(Debug, Default)]
pub struct TrivialFeedback {
    playing: AtomicBool,
    last: Mutex<Option<Value>>,
}

#[async_trait::async_trait]
impl Feedback for TrivialFeedback {
    async fn on_play(&self) -> anyhow::Result<()> {
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_pause(&self) -> anyhow::Result<()> {
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn on_control_event(&self, data: &SignalData) -> anyhow::Result<()> {
        let value = data.get("data").cloned().unwrap_or(Value::Null);
        if self.playing.load(Ordering::SeqCst) {
            tracing::debug!(%value, "Control value");
        }
        *self
            .last
            .lock()
            .map_err(|_| anyhow::anyhow!("value slot poisoned"))? = Some(value);
        Ok(())
    }

    async fn on_interaction_event(&self, data: &SignalData) -> anyhow::Result<()> {
        tracing::info!(keys = ?data.keys().collect::<Vec<_>>(), "Interaction event");
        Ok(())
    }

    fn variables(&self) -> SignalData {
        let last = self.last.lock().ok().and_then(|v| v.clone());
        let mut vars = SignalData::new();
        vars.insert("data".to_string(), last.unwrap_or(Value::Null));
        vars.insert(
            "playing".to_string(),
            Value::Bool(self.playing.load(Ordering::SeqCst)),
        );
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::data;

    #[tokio::test]
    async fn benchmark_records_latency_tuples() {
        let fb = BenchmarkFeedback::default();
        fb.on_init().await.unwrap();
        let sent = now_timestamp();
        fb.on_control_event(&data([("tuple", json!([7, sent]))]))
            .await
            .unwrap();

        let samples = fb.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0, json!(7));
        assert_eq!(samples[0].1, sent);
        assert!(samples[0].2 >= sent);

        let vars = fb.variables();
        assert_eq!(vars["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn benchmark_rejects_bad_tuple() {
        let fb = BenchmarkFeedback::default();
        assert!(fb.on_control_event(&data([("tuple", json!([1]))])).await.is_err());
        assert!(fb.on_control_event(&SignalData::new()).await.is_err());
        assert!(fb.samples().is_empty());
    }

    #[tokio::test]
    async fn timer_exposes_elapsed_after_play() {
        let fb = Timer::new(1000);
        assert_eq!(fb.variables()["elapsed"], Value::Null);
        fb.on_play().await.unwrap();
        assert!(fb.variables()["elapsed"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn trivial_keeps_last_value() {
        let fb = TrivialFeedback::default();
        fb.on_play().await.unwrap();
        fb.on_control_event(&data([("data", json!(0.25))])).await.unwrap();
        fb.on_control_event(&data([("data", json!(-0.5))])).await.unwrap();
        let vars = fb.variables();
        assert_eq!(vars["data"], json!(-0.5));
        assert_eq!(vars["playing"], json!(true));
    }
}
