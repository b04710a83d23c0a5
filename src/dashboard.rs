//! Read-only terminal dashboard.
//!
//! Re-renders the registry snapshot on a fixed tick. The dashboard never
//! mutates proxy state; a slow or stuck probe elsewhere only means a stale
//! row here, never a blocked refresh.

use owo_colors::OwoColorize;
use std::io::Write;
use std::time::Duration;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::registry::StatusBoard;
use crate::supervisor::{HealthState, ProxyStatus};

#[derive(Tabled)]
struct StatusRow {
    name: String,
    domain: String,
    status: String,
    port: String,
    nodes: String,
    active_node: String,
    ping: String,
    last_probe: String,
}

/// Render the snapshot on every tick until shutdown.
pub async fn run(
    board: StatusBoard,
    pac_port: u16,
    refresh: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let snapshot = board.snapshot().await;
                let frame = render(&snapshot, pac_port);
                // Clear screen and home the cursor before each frame.
                print!("\x1b[2J\x1b[H{frame}");
                let _ = std::io::stdout().flush();
            }
        }
    }
}

fn render(snapshot: &[ProxyStatus], pac_port: u16) -> String {
    let rows: Vec<StatusRow> = snapshot.iter().map(build_row).collect();
    let mut table = Table::new(rows);
    table.with(Style::ascii());

    let (healthy, unhealthy, no_nodes) = count_status(snapshot);
    let mut counts = format!(
        "{} {healthy} healthy  {} {unhealthy} unhealthy",
        "✓".green(),
        "✗".red()
    );
    if no_nodes > 0 {
        counts.push_str(&format!("  {} {no_nodes} no nodes", "-".yellow()));
    }

    format!(
        "{}\n\n{table}\n\nPAC URL: {}\n{counts}\nPress Ctrl+C to quit.\n",
        "Installation Proxies".bold(),
        format!("http://localhost:{pac_port}/proxy.pac").underline()
    )
}

fn build_row(status: &ProxyStatus) -> StatusRow {
    StatusRow {
        name: status.name.clone(),
        domain: status.domain.clone(),
        status: format_status(status),
        port: status.port.to_string(),
        nodes: status.node_count.to_string(),
        active_node: status
            .active_node
            .clone()
            .unwrap_or_else(|| "-".to_string()),
        ping: format_ping(status),
        last_probe: format_last_probe(status),
    }
}

fn format_status(status: &ProxyStatus) -> String {
    if status.node_count == 0 {
        return "- no nodes".yellow().to_string();
    }
    match status.health {
        HealthState::Healthy => "✓ healthy".green().to_string(),
        HealthState::Unhealthy => "✗ unhealthy".red().to_string(),
        HealthState::Unknown => "? unknown".dimmed().to_string(),
    }
}

fn format_ping(status: &ProxyStatus) -> String {
    status
        .last_probe
        .as_ref()
        .filter(|probe| probe.success)
        .map(|probe| format!("{}ms", probe.duration.as_millis()))
        .unwrap_or_else(|| "-".to_string())
}

/// HTTP status or error of the most recent probe, plus how long ago it ran.
fn format_last_probe(status: &ProxyStatus) -> String {
    let Some(probe) = &status.last_probe else {
        return "never".to_string();
    };
    let outcome = match (probe.status, &probe.error) {
        (Some(code), _) => code.to_string(),
        (None, Some(error)) => {
            let mut short: String = error.chars().take(40).collect();
            if error.chars().count() > 40 {
                short.push('…');
            }
            short
        }
        (None, None) => "-".to_string(),
    };
    format!("{outcome} ({})", format_time_ago(probe.at))
}

fn format_time_ago(at: chrono::DateTime<chrono::Utc>) -> String {
    let ago = chrono::Utc::now().signed_duration_since(at);
    if ago.num_seconds() < 60 {
        format!("{}s ago", ago.num_seconds().max(0))
    } else if ago.num_minutes() < 60 {
        format!("{}m ago", ago.num_minutes())
    } else {
        format!("{}h ago", ago.num_hours())
    }
}

fn count_status(snapshot: &[ProxyStatus]) -> (usize, usize, usize) {
    let mut healthy = 0;
    let mut unhealthy = 0;
    let mut no_nodes = 0;
    for status in snapshot {
        if status.node_count == 0 {
            no_nodes += 1;
        } else if status.health == HealthState::Healthy {
            healthy += 1;
        } else {
            unhealthy += 1;
        }
    }
    (healthy, unhealthy, no_nodes)
}
