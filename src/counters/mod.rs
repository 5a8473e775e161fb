//! Interface counter sampling.
//!
//! The OS reports cumulative counters per interface. The sampler keeps the
//! previous reading of each interface as its baseline and turns consecutive
//! readings into per-interval deltas. A counter that goes backwards means
//! the interface was reset; that interval gets no delta and the new reading
//! becomes the baseline.

mod procfs;

pub use procfs::*;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

/// Cumulative counters of one interface as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    pub dropin: u64,
    pub dropout: u64,
}

/// Change of every counter over one interval.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CounterDelta {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    pub dropin: u64,
    pub dropout: u64,
    /// Seconds between the baseline reading and this one.
    pub elapsed_secs: f64,
}

impl CounterDelta {
    /// Per-second rate of one of this delta's fields.
    pub fn rate(&self, value: u64) -> Option<f64> {
        (self.elapsed_secs > 0.0).then(|| value as f64 / self.elapsed_secs)
    }

    fn accumulate(&mut self, other: &CounterDelta) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_recv += other.bytes_recv;
        self.packets_sent += other.packets_sent;
        self.packets_recv += other.packets_recv;
        self.errin += other.errin;
        self.errout += other.errout;
        self.dropin += other.dropin;
        self.dropout += other.dropout;
        self.elapsed_secs = self.elapsed_secs.max(other.elapsed_secs);
    }
}

/// Outcome of reducing one interface's readings for an interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeltaState {
    /// No baseline yet (first reading since start or since it reappeared).
    Initial,
    /// At least one counter went backwards; the baseline was replaced.
    Reset,
    Valid(CounterDelta),
}

impl DeltaState {
    pub fn delta(&self) -> Option<CounterDelta> {
        match self {
            DeltaState::Valid(d) => Some(*d),
            _ => None,
        }
    }
}

/// Difference between two readings, or `None` if any counter decreased.
///
/// A decrease invalidates the whole interface for the interval rather than
/// just the affected field.
pub fn reduce(previous: &RawCounters, current: &RawCounters, elapsed_secs: f64) -> Option<CounterDelta> {
    Some(CounterDelta {
        bytes_sent: current.bytes_sent.checked_sub(previous.bytes_sent)?,
        bytes_recv: current.bytes_recv.checked_sub(previous.bytes_recv)?,
        packets_sent: current.packets_sent.checked_sub(previous.packets_sent)?,
        packets_recv: current.packets_recv.checked_sub(previous.packets_recv)?,
        errin: current.errin.checked_sub(previous.errin)?,
        errout: current.errout.checked_sub(previous.errout)?,
        dropin: current.dropin.checked_sub(previous.dropin)?,
        dropout: current.dropout.checked_sub(previous.dropout)?,
        elapsed_secs,
    })
}

/// Per-interface result of one interval.
#[derive(Debug, Clone, PartialEq)]
pub struct IfaceSample {
    pub iface: String,
    pub state: DeltaState,
}

/// Everything the sampler produced for one interval.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalCounters {
    pub at: DateTime<Utc>,
    /// Sorted by interface name.
    pub interfaces: Vec<IfaceSample>,
    /// Sum of the valid per-interface deltas; `None` if there were none.
    pub total: Option<CounterDelta>,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    counters: RawCounters,
    at: DateTime<Utc>,
}

/// Turns cumulative readings into deltas. Owns the per-interface baseline.
pub struct CounterSampler<S: CounterSource> {
    source: S,
    ignore: Vec<String>,
    baselines: HashMap<String, Baseline>,
}

impl<S: CounterSource> CounterSampler<S> {
    pub fn new(source: S, ignore: Vec<String>) -> Self {
        Self {
            source,
            ignore,
            baselines: HashMap::new(),
        }
    }

    /// Read the source and reduce against the stored baselines.
    ///
    /// A failed read yields an interval without counter data and leaves the
    /// baselines untouched.
    pub fn sample(&mut self, now: DateTime<Utc>) -> IntervalCounters {
        match self.source.read() {
            Ok(readings) => self.observe(now, readings),
            Err(e) => {
                tracing::warn!("CounterSampler: failed to read interface counters: {}", e);
                IntervalCounters {
                    at: now,
                    interfaces: Vec::new(),
                    total: None,
                }
            }
        }
    }

    /// Reduce a set of readings taken at `now`.
    pub fn observe(&mut self, now: DateTime<Utc>, readings: BTreeMap<String, RawCounters>) -> IntervalCounters {
        let mut interfaces = Vec::with_capacity(readings.len());
        let mut total: Option<CounterDelta> = None;
        let mut next = HashMap::with_capacity(readings.len());

        for (iface, current) in readings {
            if self.ignore.iter().any(|i| i == &iface) {
                continue;
            }

            let state = match self.baselines.get(&iface) {
                None => DeltaState::Initial,
                Some(prev) => {
                    let elapsed = (now - prev.at).num_milliseconds() as f64 / 1000.0;
                    match reduce(&prev.counters, &current, elapsed) {
                        Some(delta) => DeltaState::Valid(delta),
                        None => {
                            tracing::warn!(
                                "CounterSampler: counters of {} went backwards, treating as reset",
                                iface
                            );
                            DeltaState::Reset
                        }
                    }
                }
            };

            if let DeltaState::Valid(delta) = &state {
                total.get_or_insert_with(CounterDelta::default).accumulate(delta);
            }

            next.insert(iface.clone(), Baseline { counters: current, at: now });
            interfaces.push(IfaceSample { iface, state });
        }

        // Interfaces that vanished start over if they come back
        self.baselines = next;

        IntervalCounters {
            at: now,
            interfaces,
            total,
        }
    }

    /// Current baseline reading of an interface.
    #[cfg(test)]
    pub fn baseline(&self, iface: &str) -> Option<RawCounters> {
        self.baselines.get(iface).map(|b| b.counters)
    }
}
