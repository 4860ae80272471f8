//! Latency benchmark against a running controller.

use std::fmt;
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::{Value, json};

use fbcontrol::bridge::MAX_DATAGRAM_LEN;
use fbcontrol::signal::{VARIABLES_KEY, data, now_timestamp};
use fbcontrol::{ControllerClient, RequestId, Signal};

const FEEDBACK: &str = "BenchmarkFeedback";

/// Widest `[id, sent, received]` sample plus its separator: a u32 id and two
/// epoch timestamps of 17 significant digits.
const SAMPLE_WIDTH: usize = 1 + 10 + 1 + 18 + 1 + 18 + 1 + 1;

#[derive(Debug, Clone, PartialEq)]
pub struct LatencyStats {
    pub sent: u32,
    pub received: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
}

impl fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "packets sent:     {}", self.sent)?;
        writeln!(f, "packets received: {}", self.received)?;
        writeln!(f, "min latency:      {:.3} ms", self.min_ms)?;
        writeln!(f, "max latency:      {:.3} ms", self.max_ms)?;
        write!(f, "avg latency:      {:.3} ms", self.avg_ms)
    }
}

/// Load BenchmarkFeedback, send `packets` control signals at `hz` (0 = burst),
/// then read back the recorded `(id, sent, received)` tuples.
pub async fn run(client: &ControllerClient, packets: u32, hz: f64) -> Result<LatencyStats> {
    let limit = max_packets();
    if packets > limit {
        bail!(
            "--packets {packets} exceeds {limit}, the most samples a {MAX_DATAGRAM_LEN} byte \
             variables reply can carry"
        );
    }
    client.send_init(FEEDBACK).await?;

    let period = (hz > 0.0)
        .then(|| Duration::try_from_secs_f64(1.0 / hz).ok())
        .flatten()
        .filter(|p| !p.is_zero());
    let mut ticker = period.map(tokio::time::interval);
    for id in 0..packets {
        if let Some(ticker) = ticker.as_mut() {
            ticker.tick().await;
        }
        client
            .send_control(data([("tuple", json!([id, now_timestamp()]))]))
            .await?;
    }
    tracing::info!(packets, hz, "Sent benchmark packets");

    let Some(vars) = client.get_variables().await? else {
        bail!("No variables from {FEEDBACK}; is the controller running?");
    };
    client.stop().await?;

    let samples = vars
        .get("data")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    match latency_stats(packets, samples) {
        Some(stats) => Ok(stats),
        None => bail!("{FEEDBACK} recorded no samples"),
    }
}

fn variables_reply(samples: Vec<Value>) -> Signal {
    let vars = data([("data", Value::Array(samples))]);
    Signal::reply(data([(VARIABLES_KEY, Value::Object(vars))])).with_request_id(RequestId::new())
}

/// Most packets whose recorded samples still fit one reply datagram.
pub fn max_packets() -> u32 {
    let overhead = fbcontrol::encode(&variables_reply(Vec::new()))
        .map_or(MAX_DATAGRAM_LEN, |bytes| bytes.len());
    let fit = MAX_DATAGRAM_LEN.saturating_sub(overhead) / SAMPLE_WIDTH;
    u32::try_from(fit).unwrap_or(u32::MAX)
}

/// Min/max/avg of `received - sent` over `[id, sent, received]` samples.
pub fn latency_stats(sent: u32, samples: &[Value]) -> Option<LatencyStats> {
    let latencies: Vec<f64> = samples
        .iter()
        .filter_map(|s| {
            let s = s.as_array()?;
            let sent = s.get(1)?.as_f64()?;
            let received = s.get(2)?.as_f64()?;
            Some((received - sent) * 1000.0)
        })
        .collect();
    if latencies.is_empty() {
        return None;
    }

    let min_ms = latencies.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ms = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;
    Some(LatencyStats {
        sent,
        received: latencies.len(),
        min_ms,
        max_ms,
        avg_ms,
    })
}
