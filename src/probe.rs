//! Health probing through a local SOCKS5 tunnel endpoint.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a single probe. Produced fresh each cycle; only the most
/// recent one is retained by the supervisor.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub success: bool,
    /// HTTP status, when a response was received at all.
    pub status: Option<u16>,
    /// Transport-level failure, when the request never completed.
    pub error: Option<String>,
    pub duration: Duration,
}

/// Issues HTTP GETs through the SOCKS5 listener on one local port.
#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
}

impl Prober {
    /// Build a prober bound to `local_port` with a hard per-request deadline.
    ///
    /// `socks5h` keeps DNS resolution on the far side of the tunnel, which is
    /// required because the probed hosts only resolve inside the private
    /// network.
    pub fn new(local_port: u16, timeout: Duration) -> Result<Self> {
        let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{local_port}"))
            .context("Failed to build SOCKS5 proxy definition")?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("Failed to build probe HTTP client")?;
        Ok(Self { client })
    }

    /// Perform one GET against `url` and classify the outcome.
    ///
    /// A response with status 200-499 counts as success: a 4xx still proves
    /// the tunnel carried the request to the backend. Only transport
    /// failures and 5xx responses mark the tunnel unhealthy.
    pub async fn probe(&self, url: &str) -> ProbeResult {
        let url = ensure_scheme(url);
        let start = Instant::now();

        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                ProbeResult {
                    success: status_is_success(status),
                    status: Some(status),
                    error: None,
                    duration: start.elapsed(),
                }
            }
            Err(err) => ProbeResult {
                success: false,
                status: err.status().map(|s| s.as_u16()),
                error: Some(err.to_string()),
                duration: start.elapsed(),
            },
        }
    }
}

/// Success classification: any response below 500 shows the tunnel works.
pub fn status_is_success(status: u16) -> bool {
    (200..500).contains(&status)
}

fn ensure_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}
