//! Database model types.

use chrono::{DateTime, Utc};

use crate::counters::CounterDelta;
use crate::probe::{DnsOutcome, LatencyStats};
use crate::throughput::ThroughputResult;

/// Interface label of the aggregate row written every interval.
pub const TOTAL_IFACE: &str = "TOTAL";

/// One row to be written for an interval.
///
/// Fields left as `None` are stored as NULL, meaning "not measured".
#[derive(Debug, Clone)]
pub struct SampleRow {
    pub time: DateTime<Utc>,
    pub host: String,
    pub iface: String,
    pub delta: Option<CounterDelta>,
    pub latency: Option<LatencyStats>,
    /// `None` on rows that do not carry interval-level metrics.
    pub dns: Option<DnsOutcome>,
    pub avail_ok: Option<bool>,
    pub throughput: Option<ThroughputResult>,
}

impl SampleRow {
    /// A row carrying counters only.
    pub fn counters_only(
        time: DateTime<Utc>,
        host: &str,
        iface: &str,
        delta: Option<CounterDelta>,
    ) -> Self {
        Self {
            time,
            host: host.to_string(),
            iface: iface.to_string(),
            delta,
            latency: None,
            dns: None,
            avail_ok: None,
            throughput: None,
        }
    }
}

/// A row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    pub time: DateTime<Utc>,
    pub host: String,
    pub iface: String,
    pub bytes_sent_delta: Option<i64>,
    pub bytes_recv_delta: Option<i64>,
    pub bytes_sent_rate: Option<f64>,
    pub bytes_recv_rate: Option<f64>,
    pub ping_avg_ms: Option<f64>,
    pub ping_loss_pct: Option<f64>,
    pub dns_ms: Option<f64>,
    pub dns_ok: Option<bool>,
    pub avail_ok: Option<bool>,
    pub thr_down_mbps: Option<f64>,
    pub thr_up_mbps: Option<f64>,
    pub thr_method: Option<String>,
}
