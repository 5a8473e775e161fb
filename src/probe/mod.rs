//! Probe module for network monitoring.
//!
//! Runs batches of reachability probes, reduces them to latency statistics,
//! times DNS resolution and derives the per-interval availability flag.

mod dns;
mod ping;

pub use dns::*;
pub use ping::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("unparsable output: {0}")]
    Parse(String),
    #[error("i/o error: {0}")]
    Io(String),
}

/// A single reachability probe: one round trip to `target`.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, target: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Summary of one batch of reachability probes. Times are milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LatencyStats {
    pub sent: u32,
    pub received: u32,
    pub min_ms: Option<f64>,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<f64>,
    /// Mean absolute difference between consecutive successful round trips.
    pub jitter_ms: Option<f64>,
    pub loss_pct: f64,
}

impl LatencyStats {
    /// Reduce per-probe results, `None` marking a lost probe.
    ///
    /// An empty batch counts as total loss.
    pub fn from_rtts(rtts: &[Option<f64>]) -> Self {
        let sent = rtts.len() as u32;
        let ok: Vec<f64> = rtts.iter().flatten().copied().collect();
        let received = ok.len() as u32;

        if ok.is_empty() {
            return Self {
                sent,
                received: 0,
                loss_pct: 100.0,
                ..Default::default()
            };
        }

        let min = ok.iter().copied().fold(f64::INFINITY, f64::min);
        let max = ok.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = ok.iter().sum::<f64>() / ok.len() as f64;
        let jitter = (ok.len() >= 2).then(|| {
            ok.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / (ok.len() - 1) as f64
        });

        Self {
            sent,
            received,
            min_ms: Some(min),
            avg_ms: Some(avg),
            max_ms: Some(max),
            jitter_ms: jitter,
            loss_pct: f64::from(sent - received) / f64::from(sent) * 100.0,
        }
    }

    /// At least one probe of the batch came back.
    pub fn reachable(&self) -> bool {
        self.loss_pct < 100.0
    }
}

/// Result of the DNS timing step of an interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DnsOutcome {
    /// DNS probing is turned off; not a failure.
    Disabled,
    Resolved(f64),
    Failed,
}

impl DnsOutcome {
    pub fn ms(&self) -> Option<f64> {
        match self {
            DnsOutcome::Resolved(ms) => Some(*ms),
            _ => None,
        }
    }

    /// `None` when disabled, so storage can tell "off" from "failed".
    pub fn ok(&self) -> Option<bool> {
        match self {
            DnsOutcome::Disabled => None,
            DnsOutcome::Resolved(_) => Some(true),
            DnsOutcome::Failed => Some(false),
        }
    }
}

/// Overall reachability of an interval.
pub fn availability(latency: &LatencyStats, dns: DnsOutcome) -> bool {
    latency.reachable() && dns != DnsOutcome::Failed
}

/// Runs a fixed-size batch of probes against one target.
pub struct LatencyProber {
    pinger: Box<dyn Pinger>,
    target: String,
    count: u32,
    timeout: Duration,
}

impl LatencyProber {
    pub fn new(pinger: Box<dyn Pinger>, target: &str, count: u32, timeout: Duration) -> Self {
        Self {
            pinger,
            target: target.to_string(),
            count: count.max(1),
            timeout,
        }
    }

    /// Probe sequentially `count` times. Each failure counts as a loss.
    pub async fn probe(&self) -> LatencyStats {
        let mut rtts = Vec::with_capacity(self.count as usize);

        for _ in 0..self.count {
            match self.pinger.ping(&self.target, self.timeout).await {
                Ok(rtt) if rtt < self.timeout => rtts.push(Some(rtt.as_secs_f64() * 1000.0)),
                Ok(_) => rtts.push(None),
                Err(e) => {
                    tracing::debug!("Ping to {} failed: {}", self.target, e);
                    rtts.push(None);
                }
            }
        }

        LatencyStats::from_rtts(&rtts)
    }
}
