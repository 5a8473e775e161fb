//! DNS timing probe.
//!
//! By default the configured hostname is resolved through the system
//! resolver. When a server is configured, a minimal A query is sent to it
//! over UDP instead, which times the server rather than any local cache.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::{DnsOutcome, ProbeError};

/// Times resolution of one hostname.
#[derive(Debug, Clone)]
pub struct DnsProbe {
    /// `None` disables the probe.
    host: Option<String>,
    server: Option<String>,
    timeout: Duration,
}

impl DnsProbe {
    pub fn new(host: Option<String>, server: Option<String>, timeout: Duration) -> Self {
        Self { host, server, timeout }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self::new(None, None, Duration::from_secs(1))
    }

    /// Resolve the hostname once. Failures are folded into the outcome.
    pub async fn measure(&self) -> DnsOutcome {
        let Some(host) = self.host.as_deref() else {
            return DnsOutcome::Disabled;
        };

        let result = match self.server.as_deref() {
            Some(server) => query_server(server, host, self.timeout).await,
            None => resolve_system(host, self.timeout).await,
        };

        match result {
            Ok(elapsed) => DnsOutcome::Resolved(elapsed.as_secs_f64() * 1000.0),
            Err(e) => {
                tracing::debug!("DNS probe for {} failed: {}", host, e);
                DnsOutcome::Failed
            }
        }
    }
}

async fn resolve_system(host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let start = Instant::now();
    let mut addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("lookup failed: {}", e)))?;

    if addrs.next().is_none() {
        return Err(ProbeError::Network(format!("no addresses for {}", host)));
    }
    Ok(start.elapsed())
}

/// Send an A query for `host` to `server` and time the answer.
async fn query_server(server: &str, host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let target_addr = server_addr(server);

    let packet = build_dns_query(host)?;
    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);

    let exchange = async {
        let socket = UdpSocket::bind(if target_addr.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" })
            .await
            .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
        socket
            .connect(&target_addr)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

        let start = Instant::now();
        socket
            .send(&packet)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

        let mut response = [0u8; 512];
        loop {
            let n = socket
                .recv(&mut response)
                .await
                .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;
            let elapsed = start.elapsed();

            if n < 12 {
                return Err(ProbeError::Parse(format!("response too short: {} bytes", n)));
            }
            if u16::from_be_bytes([response[0], response[1]]) != tx_id {
                // Late answer to an earlier query
                continue;
            }
            // RCODE is the low nibble of byte 3
            let rcode = response[3] & 0x0F;
            if rcode != 0 {
                return Err(ProbeError::Network(format!("DNS error RCODE: {}", rcode)));
            }
            return Ok(elapsed);
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

/// `host[:port]`, defaulting to port 53.
fn server_addr(server: &str) -> String {
    if let Ok(ip) = server.parse::<IpAddr>() {
        return SocketAddr::new(ip, 53).to_string();
    }
    if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:53", server)
    }
}

/// Build a DNS query packet for the A record of `host`.
fn build_dns_query(host: &str) -> Result<Vec<u8>, ProbeError> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100; // standard query, recursion desired

    let mut packet = Vec::with_capacity(32 + host.len());
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // ANCOUNT, NSCOUNT, ARCOUNT

    encode_qname(host, &mut packet)?;

    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN

    Ok(packet)
}

/// Encode a hostname as length-prefixed labels.
fn encode_qname(host: &str, out: &mut Vec<u8>) -> Result<(), ProbeError> {
    let host = host.trim_end_matches('.');
    if host.is_empty() || host.len() > 253 {
        return Err(ProbeError::Config(format!("invalid DNS name {:?}", host)));
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 || !label.is_ascii() {
            return Err(ProbeError::Config(format!("invalid DNS label {:?} in {:?}", label, host)));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dns_query() {
        let packet = build_dns_query("example.com").unwrap();
        // 12 byte header + 13 byte name + 4 byte type/class
        assert_eq!(packet.len(), 29);
        assert_eq!(&packet[12..25], b"\x07example\x03com\x00");
        assert_eq!(&packet[25..], &[0u8, 1, 0, 1]);
    }

    #[test]
    fn test_encode_qname_rejects_bad_names() {
        let mut buf = Vec::new();
        assert!(encode_qname("", &mut buf).is_err());
        assert!(encode_qname("a..b", &mut buf).is_err());
        assert!(encode_qname(&"x".repeat(64), &mut buf).is_err());
    }

    #[test]
    fn test_server_addr_defaults_port() {
        assert_eq!(server_addr("1.1.1.1"), "1.1.1.1:53");
        assert_eq!(server_addr("::1"), "[::1]:53");
        assert_eq!(server_addr("10.0.0.1:5353"), "10.0.0.1:5353");
        assert_eq!(server_addr("dns.local"), "dns.local:53");
    }

    #[test]
    fn test_trailing_dot_is_accepted() {
        let mut buf = Vec::new();
        encode_qname("example.com.", &mut buf).unwrap();
        assert_eq!(buf, b"\x07example\x03com\x00");
    }

    #[tokio::test]
    async fn test_disabled_probe_is_not_a_failure() {
        assert_eq!(DnsProbe::disabled().measure().await, DnsOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails() {
        let probe = DnsProbe::new(
            Some("example.com".to_string()),
            Some("127.0.0.1:9".to_string()),
            Duration::from_millis(200),
        );
        assert_eq!(probe.measure().await, DnsOutcome::Failed);
    }
}
