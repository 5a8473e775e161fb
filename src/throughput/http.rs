//! HTTP download throughput strategy.

use async_trait::async_trait;
use std::time::{Duration, Instant};

use super::{Direction, ThroughputMethod, ThroughputResult, ThroughputStrategy};
use crate::probe::ProbeError;

/// Extra time the client may spend on connect and headers.
const HTTP_GRACE: Duration = Duration::from_secs(8);

/// Streams a URL for a bounded time and reports the download rate.
///
/// Includes HTTP overhead. Whatever direction is requested, only the
/// download rate is measured.
pub struct HttpDownloadStrategy {
    url: String,
    budget: Duration,
    client: reqwest::Client,
}

impl HttpDownloadStrategy {
    pub fn new(url: &str, budget: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(budget + HTTP_GRACE)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(Self::with_client(url, budget, client))
    }

    pub fn with_client(url: &str, budget: Duration, client: reqwest::Client) -> Self {
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("http://{}", url)
        };
        Self { url, budget, client }
    }
}

#[async_trait]
impl ThroughputStrategy for HttpDownloadStrategy {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn measure(&self, _direction: Direction) -> Result<ThroughputResult, ProbeError> {
        let limit = self.budget + HTTP_GRACE;
        let start = Instant::now();

        let mut response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| map_reqwest_error(e, limit))?;

        // Read until the body ends or the budget is spent
        let mut total: u64 = 0;
        loop {
            let remaining = self.budget.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, response.chunk()).await {
                Err(_) => break,
                Ok(Ok(Some(chunk))) => total += chunk.len() as u64,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => return Err(map_reqwest_error(e, limit)),
            }
        }

        let down = download_mbps(total, start.elapsed())
            .ok_or_else(|| ProbeError::Network(format!("no data received from {}", self.url)))?;

        Ok(ThroughputResult {
            down_mbps: Some(down),
            up_mbps: None,
            method: ThroughputMethod::Http,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error, limit: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(limit)
    } else {
        ProbeError::Network(e.to_string())
    }
}

/// Megabits per second for `bytes` moved in `elapsed`.
fn download_mbps(bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    (bytes > 0 && secs > 0.0).then(|| (bytes * 8) as f64 / 1e6 / secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throughput::testing::serve_once;

    fn local_client() -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[test]
    fn test_download_mbps() {
        assert_eq!(download_mbps(1_000_000, Duration::from_secs(8)), Some(1.0));
        assert_eq!(download_mbps(0, Duration::from_secs(1)), None);
        assert_eq!(download_mbps(10, Duration::ZERO), None);
    }

    #[test]
    fn test_scheme_is_added() {
        let s = HttpDownloadStrategy::with_client("example.com/x", Duration::from_secs(1), local_client());
        assert_eq!(s.url, "http://example.com/x");
    }

    #[tokio::test]
    async fn test_upload_request_still_measures_download() {
        let url = serve_once(64 * 1024, "200 OK").await;
        let s = HttpDownloadStrategy::with_client(&url, Duration::from_secs(5), local_client());

        let r = s.measure(Direction::Upload).await.unwrap();
        assert_eq!(r.method, ThroughputMethod::Http);
        assert_eq!(r.up_mbps, None);
        assert!(r.down_mbps.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_invalid_host_fails() {
        let s = HttpDownloadStrategy::with_client(
            "http://256.256.256.256",
            Duration::from_millis(100),
            local_client(),
        );
        assert!(s.measure(Direction::Download).await.is_err());
    }

    #[tokio::test]
    async fn test_measures_local_download() {
        let url = serve_once(256 * 1024, "200 OK").await;
        let s = HttpDownloadStrategy::with_client(&url, Duration::from_secs(5), local_client());

        let r = s.measure(Direction::Bidirectional).await.unwrap();
        assert_eq!(r.method, ThroughputMethod::Http);
        assert_eq!(r.up_mbps, None);
        assert!(r.down_mbps.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_http_error_status_fails() {
        let url = serve_once(0, "404 Not Found").await;
        let s = HttpDownloadStrategy::with_client(&url, Duration::from_secs(5), local_client());
        assert!(matches!(s.measure(Direction::Download).await, Err(ProbeError::Network(_))));
    }
}
