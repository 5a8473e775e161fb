//! Counter sources. The production source parses `/proc/net/dev`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use super::RawCounters;
use crate::probe::ProbeError;

/// Anything that can report cumulative per-interface counters.
pub trait CounterSource: Send {
    fn read(&mut self) -> Result<BTreeMap<String, RawCounters>, ProbeError>;
}

/// Reads the Linux `/proc/net/dev` table.
#[derive(Debug, Clone)]
pub struct ProcNetDev {
    path: PathBuf,
}

impl Default for ProcNetDev {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/net/dev"),
        }
    }
}

impl CounterSource for ProcNetDev {
    fn read(&mut self) -> Result<BTreeMap<String, RawCounters>, ProbeError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| ProbeError::Io(format!("{}: {}", self.path.display(), e)))?;
        parse_proc_net_dev(&text)
    }
}

/// Parse the body of `/proc/net/dev`.
///
/// Each data line is `iface: rx_bytes rx_packets rx_errs rx_drop rx_fifo
/// rx_frame rx_compressed rx_multicast tx_bytes tx_packets tx_errs tx_drop
/// ...`. The two header lines have no colon-separated counters and are
/// skipped.
pub fn parse_proc_net_dev(text: &str) -> Result<BTreeMap<String, RawCounters>, ProbeError> {
    let mut out = BTreeMap::new();

    for line in text.lines() {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || name.contains('|') {
            continue;
        }

        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|f| f.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|e| ProbeError::Parse(format!("bad counter for {}: {}", name, e)))?;
        if fields.len() < 12 {
            return Err(ProbeError::Parse(format!(
                "expected at least 12 counters for {}, got {}",
                name,
                fields.len()
            )));
        }

        out.insert(
            name.to_string(),
            RawCounters {
                bytes_recv: fields[0],
                packets_recv: fields[1],
                errin: fields[2],
                dropin: fields[3],
                bytes_sent: fields[8],
                packets_sent: fields[9],
                errout: fields[10],
                dropout: fields[11],
            },
        );
    }

    Ok(out)
}

/// Scripted source for tests: hands out queued readings in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct StaticSource {
    queue: std::collections::VecDeque<BTreeMap<String, RawCounters>>,
    fail: bool,
}

#[cfg(test)]
impl StaticSource {
    pub fn scripted(readings: Vec<BTreeMap<String, RawCounters>>) -> Self {
        Self {
            queue: readings.into(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            queue: Default::default(),
            fail: true,
        }
    }
}

#[cfg(test)]
impl CounterSource for StaticSource {
    fn read(&mut self) -> Result<BTreeMap<String, RawCounters>, ProbeError> {
        if self.fail {
            return Err(ProbeError::Io("scripted failure".to_string()));
        }
        Ok(self.queue.pop_front().unwrap_or_default())
    }
}
