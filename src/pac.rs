//! PAC (proxy auto-configuration) rendering and HTTP serving.
//!
//! The PAC body is a pure function of the domain/port pairs; the HTTP
//! handler re-renders it from the registry snapshot on every request so
//! browsers always see the current proxy list.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::sync::watch;

use crate::registry::StatusBoard;
use crate::supervisor::ProxyStatus;

const PAC_PATH: &str = "/proxy.pac";
const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// One routing clause of the PAC file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacEntry {
    pub domain: String,
    pub port: u16,
}

impl From<&ProxyStatus> for PacEntry {
    fn from(status: &ProxyStatus) -> Self {
        Self {
            domain: status.domain.clone(),
            port: status.port,
        }
    }
}

/// Render the `FindProxyForURL` body: one `dnsDomainIs` clause per entry in
/// input order, then a `DIRECT` fallback.
pub fn render_pac(entries: &[PacEntry]) -> String {
    let mut body = String::from("function FindProxyForURL(url, host) {");
    for entry in entries {
        body.push_str(&format!(
            "\n  if (dnsDomainIs(host, '{}')) {{ return 'SOCKS5 localhost:{}'; }}",
            entry.domain, entry.port
        ));
    }
    body.push_str("\n  return 'DIRECT';\n}\n");
    body
}

async fn pac_handler(State(board): State<StatusBoard>) -> impl IntoResponse {
    tracing::debug!("Serving request to PAC file");
    let entries: Vec<PacEntry> = board.snapshot().await.iter().map(PacEntry::from).collect();
    (
        [(header::CONTENT_TYPE, PAC_CONTENT_TYPE)],
        render_pac(&entries),
    )
}

/// Serve the PAC file until shutdown is signaled.
///
/// Unlike most failures in this process, not being able to bind the PAC
/// port is fatal: without the PAC file no browser ever reaches the tunnels.
pub async fn serve(board: StatusBoard, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = Router::new()
        .route(PAC_PATH, get(pac_handler))
        .with_state(board);

    let bind: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind PAC server to {bind}"))?;

    tracing::info!(
        url = %format!("http://localhost:{port}{PAC_PATH}"),
        "Serving proxy auto-configuration (PAC) file"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            tracing::info!("PAC server shutting down");
        })
        .await
        .context("PAC server error")?;

    Ok(())
}
