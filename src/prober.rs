use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::config::ProbeSettings;

/// Latency measurement of a single endpoint.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Median connect latency in whole milliseconds, or `None` if unreachable.
    async fn measure(&self, ip: &str, port: u16) -> Option<u32>;
}

/// Reduced ping plus every completed trial's raw sample. `ping` only counts the samples inside
/// the validity window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub ping: Option<u32>,
    pub samples: Vec<f64>,
}

/// Times repeated TCP connects to an endpoint.
///
/// - Attempts are sequential and separated by a short gap so one connect does not skew the next.
/// - Each attempt is bounded by `tokio::time::timeout`; an attempt whose elapsed time reaches the
///   timeout is discarded even if the connect raced it.
/// - Samples outside the open interval `(min_valid, max_valid)` are reported but left out of the
///   median.
#[derive(Debug, Clone)]
pub struct TcpProber {
    attempts: u32,
    timeout: Duration,
    gap: Duration,
    min_valid_ms: f64,
    max_valid_ms: f64,
}

impl TcpProber {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self {
            attempts: settings.attempts.max(1),
            timeout: settings.timeout(),
            gap: settings.gap(),
            min_valid_ms: settings.min_valid_ms,
            max_valid_ms: settings.max_valid_ms,
        }
    }

    /// Same bounds as `self`, different attempt count and per-attempt timeout.
    pub fn with_limits(&self, attempts: u32, timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            timeout,
            ..self.clone()
        }
    }

    pub async fn measure_samples(&self, ip: &str, port: u16) -> ProbeReport {
        let ip: IpAddr = match ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                debug!(%ip, "not an IP address, skipping probe");
                return ProbeReport::default();
            }
        };
        let addr = SocketAddr::new(ip, port);

        let mut samples = Vec::with_capacity(self.attempts as usize);
        for attempt in 0..self.attempts {
            if attempt > 0 {
                time::sleep(self.gap).await;
            }
            if let Some(ms) = self.sample_once(addr).await {
                if ms <= self.min_valid_ms || ms >= self.max_valid_ms {
                    trace!(%addr, ms, "sample out of valid range");
                }
                samples.push(ms);
            }
        }

        let ping = reduce_samples(&samples, self.min_valid_ms, self.max_valid_ms);
        debug!(%addr, ?ping, completed = samples.len(), "probe finished");
        ProbeReport { ping, samples }
    }

    async fn sample_once(&self, addr: SocketAddr) -> Option<f64> {
        let start = Instant::now();
        match time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => {
                let elapsed = start.elapsed();
                if elapsed >= self.timeout {
                    return None;
                }
                Some(elapsed.as_secs_f64() * 1000.0)
            }
            Ok(Err(e)) => {
                trace!(%addr, error = %e, "connect failed");
                None
            }
            Err(_) => {
                trace!(%addr, "connect timed out");
                None
            }
        }
    }
}

#[async_trait]
impl Probe for TcpProber {
    async fn measure(&self, ip: &str, port: u16) -> Option<u32> {
        self.measure_samples(ip, port).await.ping
    }
}

/// Median of the samples inside `(min_valid, max_valid)`, rounded and floored at 1 ms.
pub fn reduce_samples(samples: &[f64], min_valid: f64, max_valid: f64) -> Option<u32> {
    let mut valid: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|ms| ms.is_finite() && *ms > min_valid && *ms < max_valid)
        .collect();
    if valid.is_empty() {
        return None;
    }
    valid.sort_by(|a, b| a.total_cmp(b));
    let mid = valid.len() / 2;
    let median = if valid.len() % 2 == 0 {
        (valid[mid - 1] + valid[mid]) / 2.0
    } else {
        valid[mid]
    };
    Some((median.round() as u32).max(1))
}
