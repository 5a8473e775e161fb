//! Scheduler module: drives sampling, probing and recording on a fixed cadence.

mod retention;

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::LoggerConfig;
use crate::counters::{CounterSampler, CounterSource, IntervalCounters, ProcNetDev};
use crate::db::{DbError, SampleRow, Store, TOTAL_IFACE};
use crate::probe::{availability, DnsOutcome, DnsProbe, IcmpPinger, LatencyProber, LatencyStats};
use crate::throughput::{
    is_due, HttpDownloadStrategy, IperfStrategy, ThroughputResult, ThroughputStrategy,
    ThroughputTester,
};

/// Loop settings that do not belong to any single component.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub host: String,
    pub interval: Duration,
    pub per_iface: bool,
    pub keep_days: f64,
    pub prune_every: u64,
}

impl From<&LoggerConfig> for SchedulerSettings {
    fn from(cfg: &LoggerConfig) -> Self {
        Self {
            host: cfg.host_label.clone(),
            interval: cfg.interval,
            per_iface: cfg.per_iface,
            keep_days: cfg.keep_days,
            prune_every: cfg.prune_every,
        }
    }
}

/// What one interval produced.
#[derive(Debug, Clone)]
pub struct IntervalReport {
    pub index: u64,
    pub rows_written: usize,
    pub total: SampleRow,
    pub pruned: usize,
}

/// The single timeline: one interval at a time, each fully recorded before
/// the next starts.
pub struct Scheduler<S: CounterSource> {
    settings: SchedulerSettings,
    store: Store,
    sampler: CounterSampler<S>,
    prober: LatencyProber,
    dns: DnsProbe,
    throughput: ThroughputTester,
    interval_index: u64,
}

impl Scheduler<ProcNetDev> {
    /// Wire up the production probes from configuration.
    pub fn from_config(cfg: &LoggerConfig, store: Store) -> Self {
        let sampler = CounterSampler::new(ProcNetDev::default(), cfg.ignore_ifaces.clone());
        let prober = LatencyProber::new(Box::new(IcmpPinger), &cfg.ping_target, cfg.ping_count, cfg.ping_timeout);
        let dns = DnsProbe::new(cfg.dns_host.clone(), cfg.dns_server.clone(), cfg.dns_timeout);
        let throughput = ThroughputTester::new(cfg.throughput_every, cfg.iperf_direction, throughput_strategies(cfg));

        if cfg.throughput_every > 0 && !throughput.is_enabled() {
            tracing::warn!(
                "Scheduler: throughput testing requested every {} intervals but neither NETLOG_IPERF_SERVER nor NETLOG_HTTP_URL is set",
                cfg.throughput_every
            );
        }

        Self::new(SchedulerSettings::from(cfg), store, sampler, prober, dns, throughput)
    }
}

/// Configured strategies in fallback order: iperf3 first, then HTTP.
///
/// The configured direction only shapes the iperf3 run; the HTTP strategy
/// always measures download.
fn throughput_strategies(cfg: &LoggerConfig) -> Vec<Box<dyn ThroughputStrategy>> {
    let mut strategies: Vec<Box<dyn ThroughputStrategy>> = Vec::new();

    if let Some(server) = &cfg.iperf_server {
        strategies.push(Box::new(IperfStrategy::new(server, cfg.iperf_port, cfg.iperf_duration)));
    }
    if let Some(url) = &cfg.http_url {
        match HttpDownloadStrategy::new(url, cfg.http_seconds) {
            Ok(s) => strategies.push(Box::new(s)),
            Err(e) => tracing::error!("Scheduler: HTTP throughput disabled: {}", e),
        }
    }
    strategies
}

impl<S: CounterSource> Scheduler<S> {
    pub fn new(
        settings: SchedulerSettings,
        store: Store,
        sampler: CounterSampler<S>,
        prober: LatencyProber,
        dns: DnsProbe,
        throughput: ThroughputTester,
    ) -> Self {
        Self {
            settings,
            store,
            sampler,
            prober,
            dns,
            throughput,
            interval_index: 0,
        }
    }

    #[cfg(test)]
    pub fn interval_index(&self) -> u64 {
        self.interval_index
    }

    #[cfg(test)]
    pub fn sampler(&self) -> &CounterSampler<S> {
        &self.sampler
    }

    /// Apply the retention horizon once.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        retention::prune(&self.store, now, self.settings.keep_days)
    }

    /// Sample, probe, record and (when due) prune for one interval.
    ///
    /// Probe failures only leave metrics absent. Only datastore errors
    /// are returned.
    pub async fn run_interval(&mut self, now: DateTime<Utc>) -> Result<IntervalReport, DbError> {
        let index = self.interval_index;

        let counters = self.sampler.sample(now);
        let latency = self.prober.probe().await;
        let dns = self.dns.measure().await;
        let throughput = self.throughput.maybe_run(index).await;

        let total = total_row(&self.settings, &counters, latency, dns, throughput);
        let mut rows = iface_rows(&self.settings, &counters);
        rows.push(total.clone());
        let rows_written = self.store.record(&rows)?;

        let pruned = if index > 0 && is_due(index, self.settings.prune_every) {
            self.prune(now)?
        } else {
            0
        };

        self.interval_index += 1;

        Ok(IntervalReport {
            index,
            rows_written,
            total,
            pruned,
        })
    }

    /// Run until `stop` fires or a datastore error occurs.
    ///
    /// The stop signal is honored between intervals and while sleeping, so
    /// the interval in progress is always fully recorded.
    pub async fn run(mut self, mut stop: broadcast::Receiver<()>) -> Result<(), DbError> {
        let deleted = self.prune(Utc::now())?;
        tracing::info!(
            "Scheduler: starting, interval={:?} per_iface={} throughput={} (startup prune removed {} rows)",
            self.settings.interval,
            self.settings.per_iface,
            self.throughput.is_enabled(),
            deleted
        );

        let mut start = Instant::now();
        loop {
            let report = self.run_interval(Utc::now()).await?;
            log_heartbeat(&report.total);
            tracing::debug!(
                "Scheduler: interval {} wrote {} rows, pruned {}",
                report.index,
                report.rows_written,
                report.pruned
            );

            if stop_requested(&mut stop) {
                break;
            }

            let now = Instant::now();
            let wake = next_wake(start, self.settings.interval, now);
            if wake > now {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = tokio::time::sleep_until(wake) => {}
                }
            } else {
                tracing::debug!(
                    "Scheduler: interval {} overran by {:?}, starting next immediately",
                    self.interval_index,
                    now - (start + self.settings.interval)
                );
            }
            start = wake;
        }

        tracing::info!("Scheduler: stopped after {} intervals", self.interval_index);
        Ok(())
    }
}

/// When the next interval starts.
///
/// Measured from the start of the current interval so probe time does not
/// accumulate as drift. If that moment has already passed, the next
/// interval starts at `now`; missed periods are not backfilled.
pub fn next_wake(start: Instant, interval: Duration, now: Instant) -> Instant {
    let due = start + interval;
    if due > now {
        due
    } else {
        now
    }
}

fn stop_requested(stop: &mut broadcast::Receiver<()>) -> bool {
    match stop.try_recv() {
        Ok(()) => true,
        Err(broadcast::error::TryRecvError::Empty) => false,
        // Lagged still means a stop was sent; Closed means nobody can send one
        Err(broadcast::error::TryRecvError::Lagged(_)) => true,
        Err(broadcast::error::TryRecvError::Closed) => true,
    }
}

/// Per-interface counter rows, empty unless enabled.
fn iface_rows(settings: &SchedulerSettings, counters: &IntervalCounters) -> Vec<SampleRow> {
    if !settings.per_iface {
        return Vec::new();
    }
    counters
        .interfaces
        .iter()
        .map(|sample| SampleRow::counters_only(counters.at, &settings.host, &sample.iface, sample.state.delta()))
        .collect()
}

/// The aggregate row. It alone carries the interval-level metrics
/// (latency, DNS, availability, throughput) and is written every interval.
fn total_row(
    settings: &SchedulerSettings,
    counters: &IntervalCounters,
    latency: LatencyStats,
    dns: DnsOutcome,
    throughput: Option<ThroughputResult>,
) -> SampleRow {
    SampleRow {
        time: counters.at,
        host: settings.host.clone(),
        iface: TOTAL_IFACE.to_string(),
        delta: counters.total,
        latency: Some(latency),
        dns: Some(dns),
        avail_ok: Some(availability(&latency, dns)),
        throughput,
    }
}

fn log_heartbeat(total: &SampleRow) {
    let up = total.delta.and_then(|d| d.rate(d.bytes_sent));
    let down = total.delta.and_then(|d| d.rate(d.bytes_recv));
    let ping = total.latency.and_then(|l| l.avg_ms);
    let loss = total.latency.map(|l| l.loss_pct);
    let dns = total.dns.and_then(|d| d.ms());

    let thr = match &total.throughput {
        Some(t) => format!(
            " thr[{}] down={} up={} Mbps",
            t.method,
            fmt_opt(t.down_mbps, 1),
            fmt_opt(t.up_mbps, 1)
        ),
        None => String::new(),
    };

    tracing::info!(
        "{} up={} B/s down={} B/s ping={} ms loss={}% dns={} ms avail={}{}",
        total.time.format("%H:%M:%S"),
        fmt_opt(up, 0),
        fmt_opt(down, 0),
        fmt_opt(ping, 1),
        fmt_opt(loss, 0),
        fmt_opt(dns, 1),
        total.avail_ok.unwrap_or(false),
        thr
    );
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => "-".to_string(),
    }
}
