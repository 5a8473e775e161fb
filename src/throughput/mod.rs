//! Bandwidth testing.
//!
//! Throughput tests are expensive, so they run only every N intervals. Two
//! strategies sit behind [`ThroughputStrategy`]: an `iperf3` client and a
//! timed HTTP download. Their numbers are not comparable, so every result
//! carries the method that produced it.

mod http;
mod iperf;

pub use http::*;
pub use iperf::*;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

use crate::probe::ProbeError;

/// Which way traffic flows during a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
    Bidirectional,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" | "upload" => Ok(Direction::Upload),
            "down" | "download" | "reverse" => Ok(Direction::Download),
            "bidir" | "both" | "bidirectional" => Ok(Direction::Bidirectional),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Tag stored in `thr_method`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThroughputMethod {
    Iperf3,
    Iperf3Reverse,
    Iperf3Bidir,
    Http,
}

impl ThroughputMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThroughputMethod::Iperf3 => "iperf3",
            ThroughputMethod::Iperf3Reverse => "iperf3-rev",
            ThroughputMethod::Iperf3Bidir => "iperf3-bidir",
            ThroughputMethod::Http => "http",
        }
    }
}

impl fmt::Display for ThroughputMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Achieved rates in megabits per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputResult {
    pub down_mbps: Option<f64>,
    pub up_mbps: Option<f64>,
    pub method: ThroughputMethod,
}

/// A way of measuring achievable bandwidth.
#[async_trait]
pub trait ThroughputStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn measure(&self, direction: Direction) -> Result<ThroughputResult, ProbeError>;
}

/// Whether a cadence-driven task is due on this interval.
///
/// Due on indices `0, every, 2*every, ...`; never when `every` is 0.
pub fn is_due(interval_index: u64, every: u64) -> bool {
    every > 0 && interval_index % every == 0
}

/// Runs throughput tests on their own cadence.
///
/// Strategies are tried in order and the first success wins, so a
/// configured HTTP URL acts as a fallback when `iperf3` fails.
pub struct ThroughputTester {
    every: u64,
    direction: Direction,
    strategies: Vec<Box<dyn ThroughputStrategy>>,
}

impl ThroughputTester {
    pub fn new(every: u64, direction: Direction, strategies: Vec<Box<dyn ThroughputStrategy>>) -> Self {
        Self {
            every,
            direction,
            strategies,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.every > 0 && !self.strategies.is_empty()
    }

    /// Run a test if one is due on `interval_index`.
    ///
    /// Failures are logged and yield `None`; they never reach the caller.
    pub async fn maybe_run(&self, interval_index: u64) -> Option<ThroughputResult> {
        if !self.is_enabled() || !is_due(interval_index, self.every) {
            return None;
        }

        for strategy in &self.strategies {
            match strategy.measure(self.direction).await {
                Ok(result) => return Some(result),
                Err(e) => {
                    tracing::warn!("Throughput: {} test failed: {}", strategy.name(), e);
                }
            }
        }
        None
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingStrategy;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_is_due_cadence() {
        let due: Vec<u64> = (0..20).filter(|i| is_due(*i, 6)).collect();
        assert_eq!(due, vec![0, 6, 12, 18]);
        assert!((0..10_000).all(|i| !is_due(i, 0)));
        assert!((0..50).all(|i| is_due(i, 1)));
    }

    #[test]
    fn test_direction_from_str() {
        assert_eq!("UP".parse::<Direction>(), Ok(Direction::Upload));
        assert_eq!("reverse".parse::<Direction>(), Ok(Direction::Download));
        assert_eq!("bidir".parse::<Direction>(), Ok(Direction::Bidirectional));
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[tokio::test]
    async fn test_attempts_only_on_cadence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tester = ThroughputTester::new(
            3,
            Direction::Upload,
            vec![Box::new(CountingStrategy::ok(calls.clone()))],
        );

        let mut ran_on = Vec::new();
        for i in 0..10 {
            if tester.maybe_run(i).await.is_some() {
                ran_on.push(i);
            }
        }
        assert_eq!(ran_on, vec![0, 3, 6, 9]);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_zero_cadence_never_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tester = ThroughputTester::new(
            0,
            Direction::Upload,
            vec![Box::new(CountingStrategy::ok(calls.clone()))],
        );
        for i in 0..1000 {
            assert!(tester.maybe_run(i).await.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_next_strategy() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut fallback = CountingStrategy::ok(second.clone());
        fallback.method = ThroughputMethod::Http;
        let tester = ThroughputTester::new(
            1,
            Direction::Download,
            vec![Box::new(CountingStrategy::failing(first.clone())), Box::new(fallback)],
        );

        let result = tester.maybe_run(0).await.unwrap();
        assert_eq!(result.method, ThroughputMethod::Http);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_strategies_failing_yields_none() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tester = ThroughputTester::new(
            1,
            Direction::Upload,
            vec![Box::new(CountingStrategy::failing(calls.clone()))],
        );
        assert!(tester.maybe_run(0).await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_method_tags() {
        let tags: Vec<&str> = [
            ThroughputMethod::Iperf3,
            ThroughputMethod::Iperf3Reverse,
            ThroughputMethod::Iperf3Bidir,
            ThroughputMethod::Http,
        ]
        .iter()
        .map(|m| m.as_str())
        .collect();
        assert_eq!(tags, vec!["iperf3", "iperf3-rev", "iperf3-bidir", "http"]);
    }
}
