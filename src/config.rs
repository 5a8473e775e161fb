//! Configuration module for netlog.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::throughput::Direction;

/// Logger configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Path to the SQLite database file (default: "netstats.db")
    pub db_path: String,
    /// Value written to the `host` column of every row
    pub host_label: String,
    /// Length of one sampling interval (default: 10s)
    pub interval: Duration,
    /// Write one row per interface in addition to TOTAL
    pub per_iface: bool,
    /// Interfaces that are never sampled (default: "lo")
    pub ignore_ifaces: Vec<String>,
    /// Reachability probe target (default: "8.8.8.8")
    pub ping_target: String,
    /// Probes per interval (default: 5)
    pub ping_count: u32,
    /// Timeout for a single reachability probe (default: 2s)
    pub ping_timeout: Duration,
    /// Hostname resolved for DNS timing; `None` disables DNS probing
    pub dns_host: Option<String>,
    /// Query this server directly instead of the system resolver
    pub dns_server: Option<String>,
    pub dns_timeout: Duration,
    /// Throughput cadence in intervals; 0 disables throughput testing
    pub throughput_every: u64,
    pub iperf_server: Option<String>,
    pub iperf_port: Option<u16>,
    pub iperf_duration: Duration,
    pub iperf_direction: Direction,
    pub http_url: Option<String>,
    pub http_seconds: Duration,
    /// Retention horizon in days; 0 or negative disables pruning
    pub keep_days: f64,
    /// Prune cadence in intervals; 0 prunes only at startup
    pub prune_every: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            db_path: "netstats.db".to_string(),
            host_label: "localhost".to_string(),
            interval: Duration::from_secs(10),
            per_iface: false,
            ignore_ifaces: vec!["lo".to_string()],
            ping_target: "8.8.8.8".to_string(),
            ping_count: 5,
            ping_timeout: Duration::from_secs(2),
            dns_host: Some("google.com".to_string()),
            dns_server: None,
            dns_timeout: Duration::from_secs(2),
            throughput_every: 0,
            iperf_server: None,
            iperf_port: None,
            iperf_duration: Duration::from_secs(5),
            iperf_direction: Direction::Upload,
            http_url: None,
            http_seconds: Duration::from_secs(5),
            keep_days: 0.0,
            prune_every: 360,
        }
    }
}

impl LoggerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is prefixed with `NETLOG_`; see `from_lookup` for the
    /// full list. Values that fail to parse keep their default.
    pub fn load() -> Self {
        let mut cfg = Self::from_lookup(|key| env::var(key).ok());
        if env::var("NETLOG_HOST_LABEL").is_err() {
            cfg.host_label = system_hostname();
        }
        cfg
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Recognized keys:
    /// - `NETLOG_DB_PATH`, `NETLOG_HOST_LABEL`
    /// - `NETLOG_INTERVAL_SECS`, `NETLOG_PER_IFACE`, `NETLOG_IGNORE_IFACES`
    /// - `NETLOG_PING_TARGET`, `NETLOG_PING_COUNT`, `NETLOG_PING_TIMEOUT_SECS`
    /// - `NETLOG_DNS_HOST` (empty disables), `NETLOG_DNS_SERVER`, `NETLOG_DNS_TIMEOUT_SECS`
    /// - `NETLOG_THROUGHPUT_EVERY`, `NETLOG_IPERF_SERVER`, `NETLOG_IPERF_PORT`,
    ///   `NETLOG_IPERF_DURATION_SECS`, `NETLOG_IPERF_DIRECTION`,
    ///   `NETLOG_HTTP_URL`, `NETLOG_HTTP_SECONDS`
    /// - `NETLOG_KEEP_DAYS`, `NETLOG_PRUNE_EVERY`
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("NETLOG_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(label) = lookup("NETLOG_HOST_LABEL") {
            cfg.host_label = label;
        }

        if let Some(secs) = parse_var::<f64, _>(&lookup, "NETLOG_INTERVAL_SECS") {
            cfg.interval = Duration::from_secs_f64(secs.max(0.1));
        }
        if let Some(flag) = lookup("NETLOG_PER_IFACE") {
            match parse_bool(&flag) {
                Some(b) => cfg.per_iface = b,
                None => tracing::warn!("Config: ignoring invalid NETLOG_PER_IFACE={:?}", flag),
            }
        }
        if let Some(list) = lookup("NETLOG_IGNORE_IFACES") {
            cfg.ignore_ifaces = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(target) = lookup("NETLOG_PING_TARGET") {
            cfg.ping_target = target;
        }
        if let Some(count) = parse_var::<u32, _>(&lookup, "NETLOG_PING_COUNT") {
            cfg.ping_count = count.max(1);
        }
        if let Some(secs) = parse_var::<f64, _>(&lookup, "NETLOG_PING_TIMEOUT_SECS") {
            cfg.ping_timeout = positive_secs(secs, cfg.ping_timeout);
        }

        if let Some(host) = lookup("NETLOG_DNS_HOST") {
            let host = host.trim();
            cfg.dns_host = (!host.is_empty()).then(|| host.to_string());
        }
        cfg.dns_server = non_empty(lookup("NETLOG_DNS_SERVER"));
        if let Some(secs) = parse_var::<f64, _>(&lookup, "NETLOG_DNS_TIMEOUT_SECS") {
            cfg.dns_timeout = positive_secs(secs, cfg.dns_timeout);
        }

        if let Some(every) = parse_var::<u64, _>(&lookup, "NETLOG_THROUGHPUT_EVERY") {
            cfg.throughput_every = every;
        }
        cfg.iperf_server = non_empty(lookup("NETLOG_IPERF_SERVER"));
        cfg.iperf_port = parse_var::<u16, _>(&lookup, "NETLOG_IPERF_PORT");
        if let Some(secs) = parse_var::<u64, _>(&lookup, "NETLOG_IPERF_DURATION_SECS") {
            cfg.iperf_duration = Duration::from_secs(secs.max(1));
        }
        if let Some(direction) = parse_var::<Direction, _>(&lookup, "NETLOG_IPERF_DIRECTION") {
            cfg.iperf_direction = direction;
        }
        cfg.http_url = non_empty(lookup("NETLOG_HTTP_URL"));
        if let Some(secs) = parse_var::<u64, _>(&lookup, "NETLOG_HTTP_SECONDS") {
            cfg.http_seconds = Duration::from_secs(secs.max(1));
        }

        if let Some(days) = parse_var::<f64, _>(&lookup, "NETLOG_KEEP_DAYS") {
            cfg.keep_days = days;
        }
        if let Some(every) = parse_var::<u64, _>(&lookup, "NETLOG_PRUNE_EVERY") {
            cfg.prune_every = every;
        }

        cfg
    }

    /// Whether DNS timing is part of every interval.
    pub fn dns_enabled(&self) -> bool {
        self.dns_host.is_some()
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Config: ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn positive_secs(secs: f64, fallback: Duration) -> Duration {
    if secs > 0.0 && secs.is_finite() {
        Duration::from_secs_f64(secs)
    } else {
        fallback
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn system_hostname() -> String {
    if let Ok(name) = env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = LoggerConfig::default();
        assert_eq!(cfg.db_path, "netstats.db");
        assert_eq!(cfg.interval, Duration::from_secs(10));
        assert_eq!(cfg.ping_target, "8.8.8.8");
        assert_eq!(cfg.throughput_every, 0);
        assert!(cfg.dns_enabled());
        assert!(!cfg.per_iface);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let cfg = LoggerConfig::from_lookup(lookup_from(&[
            ("NETLOG_DB_PATH", "/tmp/x.db"),
            ("NETLOG_INTERVAL_SECS", "2.5"),
            ("NETLOG_PER_IFACE", "yes"),
            ("NETLOG_IGNORE_IFACES", "lo, docker0,"),
            ("NETLOG_PING_COUNT", "0"),
            ("NETLOG_THROUGHPUT_EVERY", "6"),
            ("NETLOG_IPERF_SERVER", "iperf.he.net"),
            ("NETLOG_IPERF_DIRECTION", "bidir"),
            ("NETLOG_KEEP_DAYS", "1.5"),
        ]));
        assert_eq!(cfg.db_path, "/tmp/x.db");
        assert_eq!(cfg.interval, Duration::from_millis(2500));
        assert!(cfg.per_iface);
        assert_eq!(cfg.ignore_ifaces, vec!["lo", "docker0"]);
        assert_eq!(cfg.ping_count, 1);
        assert_eq!(cfg.throughput_every, 6);
        assert_eq!(cfg.iperf_server.as_deref(), Some("iperf.he.net"));
        assert_eq!(cfg.iperf_direction, Direction::Bidirectional);
        assert_eq!(cfg.keep_days, 1.5);
    }

    #[test]
    fn test_empty_dns_host_disables_dns() {
        let cfg = LoggerConfig::from_lookup(lookup_from(&[("NETLOG_DNS_HOST", "  ")]));
        assert!(!cfg.dns_enabled());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = LoggerConfig::from_lookup(lookup_from(&[
            ("NETLOG_INTERVAL_SECS", "soon"),
            ("NETLOG_PING_TIMEOUT_SECS", "-3"),
            ("NETLOG_IPERF_DIRECTION", "sideways"),
        ]));
        assert_eq!(cfg.interval, Duration::from_secs(10));
        assert_eq!(cfg.ping_timeout, Duration::from_secs(2));
        assert_eq!(cfg.iperf_direction, Direction::Upload);
    }
}
