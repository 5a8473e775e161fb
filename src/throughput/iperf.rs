//! iperf3 throughput strategy.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::{Direction, ThroughputMethod, ThroughputResult, ThroughputStrategy};
use crate::probe::ProbeError;

/// Extra time granted to iperf3 beyond the test duration for connection
/// setup and teardown.
const IPERF_GRACE: Duration = Duration::from_secs(12);

/// Runs the `iperf3` client against a server and reads its JSON report.
#[derive(Debug, Clone)]
pub struct IperfStrategy {
    server: String,
    port: Option<u16>,
    duration: Duration,
    binary: String,
}

impl IperfStrategy {
    pub fn new(server: &str, port: Option<u16>, duration: Duration) -> Self {
        Self {
            server: server.to_string(),
            port,
            duration,
            binary: "iperf3".to_string(),
        }
    }

    fn args(&self, direction: Direction) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            self.server.clone(),
            "-J".to_string(),
            "-t".to_string(),
            self.duration.as_secs().max(1).to_string(),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        match direction {
            Direction::Upload => {}
            Direction::Download => args.push("-R".to_string()),
            Direction::Bidirectional => args.push("--bidir".to_string()),
        }
        args
    }
}

#[async_trait]
impl ThroughputStrategy for IperfStrategy {
    fn name(&self) -> &'static str {
        "iperf3"
    }

    async fn measure(&self, direction: Direction) -> Result<ThroughputResult, ProbeError> {
        let limit = self.duration + IPERF_GRACE;
        let child = Command::new(&self.binary)
            .args(self.args(direction))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(limit, child)
            .await
            .map_err(|_| ProbeError::Timeout(limit))?
            .map_err(|e| ProbeError::Command(format!("failed to execute {}: {}", self.binary, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            // iperf3 -J still prints a JSON object with an "error" field
            let reason = serde_json::from_str::<IperfReport>(&stdout)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| String::from_utf8_lossy(&output.stderr).trim().to_string());
            return Err(ProbeError::Command(format!(
                "iperf3 exited with {}: {}",
                output.status, reason
            )));
        }

        parse_iperf_report(&stdout, direction)
    }
}

#[derive(Debug, Deserialize)]
struct IperfReport {
    #[serde(default)]
    end: Option<IperfEnd>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IperfEnd {
    sum_sent: Option<IperfSum>,
    sum_received: Option<IperfSum>,
    sum_received_bidir_reverse: Option<IperfSum>,
}

#[derive(Debug, Deserialize)]
struct IperfSum {
    bits_per_second: f64,
}

/// Extract the achieved rates from an `iperf3 -J` report.
///
/// `sum_sent` is what the client pushed (upload). In reverse mode the
/// server pushes, and `sum_received` is what the client got (download).
/// With `--bidir` the reverse stream is reported separately.
pub fn parse_iperf_report(json: &str, direction: Direction) -> Result<ThroughputResult, ProbeError> {
    let report: IperfReport = serde_json::from_str(json)
        .map_err(|e| ProbeError::Parse(format!("invalid iperf3 JSON: {}", e)))?;
    if let Some(err) = report.error {
        return Err(ProbeError::Command(format!("iperf3 reported: {}", err)));
    }
    let end = report
        .end
        .ok_or_else(|| ProbeError::Parse("iperf3 report has no \"end\" section".to_string()))?;

    let mbps = |sum: &Option<IperfSum>| sum.as_ref().map(|s| s.bits_per_second / 1e6);

    let (down, up, method) = match direction {
        Direction::Upload => (None, mbps(&end.sum_sent), ThroughputMethod::Iperf3),
        Direction::Download => (mbps(&end.sum_received), None, ThroughputMethod::Iperf3Reverse),
        Direction::Bidirectional => (
            mbps(&end.sum_received_bidir_reverse).or_else(|| mbps(&end.sum_received)),
            mbps(&end.sum_sent),
            ThroughputMethod::Iperf3Bidir,
        ),
    };

    if down.is_none() && up.is_none() {
        return Err(ProbeError::Parse("iperf3 report has no usable rate".to_string()));
    }

    Ok(ThroughputResult {
        down_mbps: down,
        up_mbps: up,
        method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPLOAD_REPORT: &str = r#"{
        "start": {"connected": []},
        "end": {
            "sum_sent": {"bytes": 62500000, "bits_per_second": 100000000.0},
            "sum_received": {"bytes": 62000000, "bits_per_second": 99000000.0}
        }
    }"#;

    const BIDIR_REPORT: &str = r#"{
        "end": {
            "sum_sent": {"bits_per_second": 20000000.0},
            "sum_received": {"bits_per_second": 19500000.0},
            "sum_sent_bidir_reverse": {"bits_per_second": 300000000.0},
            "sum_received_bidir_reverse": {"bits_per_second": 295000000.0}
        }
    }"#;

    #[test]
    fn test_args_per_direction() {
        let s = IperfStrategy::new("iperf.he.net", Some(5201), Duration::from_secs(8));
        assert_eq!(
            s.args(Direction::Upload),
            vec!["-c", "iperf.he.net", "-J", "-t", "8", "-p", "5201"]
        );
        assert_eq!(s.args(Direction::Download).last().map(String::as_str), Some("-R"));
        assert_eq!(s.args(Direction::Bidirectional).last().map(String::as_str), Some("--bidir"));
    }

    #[test]
    fn test_parse_upload() {
        let r = parse_iperf_report(UPLOAD_REPORT, Direction::Upload).unwrap();
        assert_eq!(r.up_mbps, Some(100.0));
        assert_eq!(r.down_mbps, None);
        assert_eq!(r.method, ThroughputMethod::Iperf3);
    }

    #[test]
    fn test_parse_reverse() {
        let r = parse_iperf_report(UPLOAD_REPORT, Direction::Download).unwrap();
        assert_eq!(r.down_mbps, Some(99.0));
        assert_eq!(r.up_mbps, None);
        assert_eq!(r.method, ThroughputMethod::Iperf3Reverse);
    }

    #[test]
    fn test_parse_bidir_uses_reverse_stream_for_download() {
        let r = parse_iperf_report(BIDIR_REPORT, Direction::Bidirectional).unwrap();
        assert_eq!(r.up_mbps, Some(20.0));
        assert_eq!(r.down_mbps, Some(295.0));
        assert_eq!(r.method, ThroughputMethod::Iperf3Bidir);
    }

    #[test]
    fn test_parse_error_report() {
        let err = parse_iperf_report(
            r#"{"start": {}, "error": "unable to connect to server"}"#,
            Direction::Upload,
        )
        .unwrap_err();
        assert!(matches!(err, ProbeError::Command(_)));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_iperf_report("iperf3: command not found", Direction::Upload),
            Err(ProbeError::Parse(_))
        ));
        assert!(matches!(
            parse_iperf_report(r#"{"end": {}}"#, Direction::Upload),
            Err(ProbeError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_probe_error() {
        let mut s = IperfStrategy::new("127.0.0.1", None, Duration::from_secs(1));
        s.binary = "/nonexistent/iperf3".to_string();
        assert!(matches!(s.measure(Direction::Upload).await, Err(ProbeError::Command(_))));
    }
}
