//! Per-installation proxy supervisor.
//!
//! Each supervisor owns one SOCKS5 tunnel, its candidate node list, and its
//! health record, exclusively. The probe loop runs as an independent task:
//! probe immediately on start, then on a fixed interval, failing over to a
//! different node when a probe fails. Readers observe the supervisor only
//! through its status cell, which is overwritten as a whole record.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;

use crate::config::{Installation, Settings};
use crate::error::SupervisorError;
use crate::inventory::NodeInventory;
use crate::probe::{ProbeResult, Prober};
use crate::registry::PortAllocator;
use crate::tunnel::Tunnel;

/// Health of one proxy, driven only by probe outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    /// Not probed yet, or stopped.
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// The most recent probe outcome, stamped with when it happened.
#[derive(Debug, Clone)]
pub struct ProbeRecord {
    pub success: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub duration: Duration,
    pub at: DateTime<Utc>,
}

/// Read-only view of one proxy, cloned by the PAC handler and dashboard.
#[derive(Debug, Clone)]
pub struct ProxyStatus {
    pub name: String,
    pub domain: String,
    pub port: u16,
    pub node_count: usize,
    pub active_node: Option<String>,
    pub health: HealthState,
    pub last_probe: Option<ProbeRecord>,
}

pub type StatusCell = Arc<RwLock<ProxyStatus>>;

/// State machine for one installation's tunnel.
#[derive(Debug)]
pub struct Supervisor {
    name: String,
    check_url: String,
    port: u16,
    probe_interval: Duration,
    candidates: Vec<String>,
    active_node: Option<String>,
    health: HealthState,
    last_probe: Option<ProbeRecord>,
    tunnel: Tunnel,
    prober: Prober,
    status: StatusCell,
}

impl Supervisor {
    /// Construct the supervisor for one installation and attempt the first
    /// tunnel launch.
    ///
    /// Inventory failures are not fatal: the proxy then exists with an empty
    /// candidate list and no tunnel. A failed launch is logged and retried
    /// by the failover path on the next probe cycle.
    pub async fn new(
        installation: &Installation,
        settings: &Settings,
        ports: &mut PortAllocator,
        inventory: &NodeInventory,
    ) -> Result<Self, SupervisorError> {
        if installation.name.trim().is_empty() {
            return Err(SupervisorError::InvalidConfiguration {
                reason: "installation name cannot be empty".to_string(),
            });
        }
        if installation.domain.trim().is_empty() {
            return Err(SupervisorError::InvalidConfiguration {
                reason: format!("domain cannot be empty for installation {}", installation.name),
            });
        }

        let port = ports.allocate();
        let probe_timeout = Duration::from_secs(settings.probe_timeout_secs);
        let prober = Prober::new(port, probe_timeout).map_err(|err| {
            SupervisorError::InvalidConfiguration {
                reason: err.to_string(),
            }
        })?;

        let candidates = match inventory.list(&installation.name).await {
            Ok(nodes) => nodes,
            Err(err) => {
                tracing::warn!(
                    name = %installation.name,
                    error = %err,
                    "Continuing without candidate nodes"
                );
                Vec::new()
            }
        };

        let status = Arc::new(RwLock::new(ProxyStatus {
            name: installation.name.clone(),
            domain: installation.domain.clone(),
            port,
            node_count: candidates.len(),
            active_node: None,
            health: HealthState::Unknown,
            last_probe: None,
        }));

        let mut supervisor = Self {
            name: installation.name.clone(),
            check_url: installation.check_url(),
            port,
            probe_interval: Duration::from_secs(settings.probe_interval_secs),
            candidates,
            active_node: None,
            health: HealthState::Unknown,
            last_probe: None,
            tunnel: Tunnel::new(&settings.tsh_binary),
            prober,
            status,
        };

        if !supervisor.candidates.is_empty() {
            if let Some(node) = supervisor.select_node() {
                supervisor.launch(node);
            }
            supervisor.sync_status().await;
        }

        Ok(supervisor)
    }

    /// Shared handle to this proxy's status record.
    pub fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    /// Probe loop. Runs until the shutdown signal fires, then tears the
    /// tunnel down. The first tick fires immediately.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.probe_cycle().await,
            }
        }

        self.shutdown().await;
    }

    /// One probe plus whatever it triggers: status update, transition
    /// logging, failover.
    async fn probe_cycle(&mut self) {
        let result = self.prober.probe(&self.check_url).await;
        let transitioned = self.record_probe(&result);

        if transitioned {
            if result.success {
                tracing::info!(
                    name = %self.name,
                    status = result.status.unwrap_or(0),
                    "Proxy is healthy"
                );
            } else {
                tracing::warn!(
                    name = %self.name,
                    error = result.error.as_deref().unwrap_or("-"),
                    status = result.status.unwrap_or(0),
                    "Proxy is unhealthy"
                );
            }
        } else {
            tracing::debug!(
                name = %self.name,
                success = result.success,
                duration_ms = result.duration.as_millis() as u64,
                "Probe completed"
            );
        }

        if !result.success {
            if self.candidates.is_empty() {
                tracing::debug!(name = %self.name, "No candidate nodes, nothing to fail over to");
            } else {
                self.failover().await;
            }
        }

        self.sync_status().await;
    }

    /// Fold a probe outcome into the health state. Returns true when this
    /// probe flipped the state, which includes the first probe after start.
    fn record_probe(&mut self, result: &ProbeResult) -> bool {
        let new_health = if result.success {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };
        let transitioned = self.health != new_health;
        self.health = new_health;
        self.last_probe = Some(ProbeRecord {
            success: result.success,
            status: result.status,
            error: result.error.clone(),
            duration: result.duration,
            at: Utc::now(),
        });
        transitioned
    }

    /// Replace the active node: stop the current tunnel, pick a different
    /// node, start the new tunnel. One sequential operation, so there is
    /// never a window with two live tunnels for this proxy.
    async fn failover(&mut self) {
        self.stop_tunnel().await;
        debug_assert!(!self.tunnel.is_live());

        match self.select_node() {
            Some(node) => self.launch(node),
            None => {
                tracing::warn!(name = %self.name, "No candidate nodes to fail over to");
            }
        }
    }

    /// Shuffled pick that avoids the currently active node when possible.
    fn select_node(&self) -> Option<String> {
        select_node(&self.candidates, self.active_node.as_deref())
    }

    fn launch(&mut self, node: String) {
        match self.tunnel.start(&node, self.port) {
            Ok(()) => {
                tracing::info!(
                    name = %self.name,
                    node = %node,
                    port = self.port,
                    pid = self.tunnel.pid().unwrap_or(0),
                    "Starting tunnel"
                );
                self.active_node = Some(node);
            }
            Err(err) => {
                tracing::warn!(
                    name = %self.name,
                    node = %node,
                    error = %err,
                    "Tunnel launch failed, will retry on next cycle"
                );
                self.active_node = None;
            }
        }
    }

    async fn stop_tunnel(&mut self) {
        if let Err(err) = self.tunnel.stop().await {
            // The handle is already cleared; nothing left to leak.
            tracing::warn!(name = %self.name, error = %err, "Tunnel stop failed");
        }
        self.active_node = None;
    }

    /// Stop the tunnel and reset health to unknown. Idempotent.
    async fn shutdown(&mut self) {
        self.stop_tunnel().await;
        self.health = HealthState::Unknown;
        self.sync_status().await;
        tracing::info!(name = %self.name, "Proxy stopped");
    }

    /// Overwrite the status cell with a complete, consistent record.
    async fn sync_status(&self) {
        let mut status = self.status.write().await;
        status.node_count = self.candidates.len();
        status.active_node = self.active_node.clone();
        status.health = self.health;
        status.last_probe = self.last_probe.clone();
    }
}

/// Shuffle uniformly, then take the first candidate that differs from the
/// current node; fall back to the first shuffled candidate when none does
/// (the single-candidate case).
fn select_node(candidates: &[String], current: Option<&str>) -> Option<String> {
    let mut shuffled: Vec<&String> = candidates.iter().collect();
    shuffled.shuffle(&mut rand::thread_rng());
    shuffled
        .iter()
        .find(|node| Some(node.as_str()) != current)
        .or_else(|| shuffled.first())
        .map(|node| (*node).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::stub_tsh;
    use tempfile::TempDir;

    fn test_settings(binary: &str) -> Settings {
        Settings {
            tsh_binary: binary.to_string(),
            probe_interval_secs: 1,
            probe_timeout_secs: 1,
            ..Settings::default()
        }
    }

    fn installation(name: &str, domain: &str) -> Installation {
        Installation {
            name: name.to_string(),
            domain: domain.to_string(),
        }
    }

    fn probe_failure() -> ProbeResult {
        ProbeResult {
            success: false,
            status: None,
            error: Some("connection refused".to_string()),
            duration: Duration::from_millis(3),
        }
    }

    fn probe_success(status: u16) -> ProbeResult {
        ProbeResult {
            success: true,
            status: Some(status),
            error: None,
            duration: Duration::from_millis(3),
        }
    }

    fn process_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_select_node_avoids_current_with_multiple_candidates() {
        let candidates = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        for _ in 0..200 {
            let picked = select_node(&candidates, Some("b")).unwrap();
            assert_ne!(picked, "b");
        }
    }

    #[test]
    fn test_select_node_single_candidate_is_idempotent() {
        let candidates = vec!["only".to_string()];
        for _ in 0..20 {
            assert_eq!(select_node(&candidates, Some("only")).unwrap(), "only");
        }
    }

    #[test]
    fn test_select_node_empty_candidates() {
        assert!(select_node(&[], None).is_none());
    }

    #[tokio::test]
    async fn test_new_rejects_empty_name() {
        let dir = TempDir::new().unwrap();
        let script = stub_tsh(&dir, &["node-a"]);
        let settings = test_settings(script.to_str().unwrap());
        let inventory = NodeInventory::from_settings(&settings);
        let mut ports = PortAllocator::new(42000);

        let err = Supervisor::new(&installation("", "x.example.com"), &settings, &mut ports, &inventory)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidConfiguration { .. }));
    }

    #[tokio::test]
    async fn test_new_rejects_empty_domain() {
        let dir = TempDir::new().unwrap();
        let script = stub_tsh(&dir, &["node-a"]);
        let settings = test_settings(script.to_str().unwrap());
        let inventory = NodeInventory::from_settings(&settings);
        let mut ports = PortAllocator::new(42010);

        let err = Supervisor::new(&installation("gremlin", ""), &settings, &mut ports, &inventory)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidConfiguration { .. }));
    }

    #[tokio::test]
    async fn test_zero_candidates_never_starts_a_tunnel() {
        let dir = TempDir::new().unwrap();
        let script = stub_tsh(&dir, &[]);
        let settings = test_settings(script.to_str().unwrap());
        let inventory = NodeInventory::from_settings(&settings);
        let mut ports = PortAllocator::new(42020);

        let mut sup = Supervisor::new(
            &installation("gremlin", "gremlin.example.com"),
            &settings,
            &mut ports,
            &inventory,
        )
        .await
        .unwrap();

        assert!(sup.candidates.is_empty());
        assert!(!sup.tunnel.is_live());
        assert_eq!(sup.health, HealthState::Unknown);

        // A failed probe with no candidates must not attempt a failover.
        sup.probe_cycle().await;
        assert!(!sup.tunnel.is_live());
        assert_eq!(sup.health, HealthState::Unhealthy);

        // Stop is idempotent and leaves health unknown.
        sup.shutdown().await;
        sup.shutdown().await;
        assert_eq!(sup.health, HealthState::Unknown);
        assert_eq!(sup.status.read().await.health, HealthState::Unknown);
    }

    #[tokio::test]
    async fn test_new_starts_tunnel_when_candidates_exist() {
        let dir = TempDir::new().unwrap();
        let script = stub_tsh(&dir, &["node-a", "node-b", "node-c"]);
        let settings = test_settings(script.to_str().unwrap());
        let inventory = NodeInventory::from_settings(&settings);
        let mut ports = PortAllocator::new(42030);

        let mut sup = Supervisor::new(
            &installation("gremlin", "gremlin.example.com"),
            &settings,
            &mut ports,
            &inventory,
        )
        .await
        .unwrap();

        assert_eq!(sup.candidates.len(), 3);
        assert!(sup.tunnel.is_live());
        assert!(sup.active_node.is_some());
        assert_eq!(sup.status.read().await.node_count, 3);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_probe_fails_over_to_a_different_node() {
        let dir = TempDir::new().unwrap();
        let script = stub_tsh(&dir, &["node-a", "node-b", "node-c"]);
        let settings = test_settings(script.to_str().unwrap());
        let inventory = NodeInventory::from_settings(&settings);
        let mut ports = PortAllocator::new(42040);

        let mut sup = Supervisor::new(
            &installation("gremlin", "gremlin.example.com"),
            &settings,
            &mut ports,
            &inventory,
        )
        .await
        .unwrap();

        let first_node = sup.active_node.clone().unwrap();
        let first_pid = sup.tunnel.pid().unwrap();

        // Nothing listens on the allocated port, so the probe fails with a
        // transport error and triggers a failover.
        sup.probe_cycle().await;

        let second_node = sup.active_node.clone().unwrap();
        let second_pid = sup.tunnel.pid().unwrap();

        assert_ne!(first_node, second_node);
        assert_ne!(first_pid, second_pid);
        assert!(!process_alive(first_pid), "old tunnel must be gone");
        assert!(process_alive(second_pid), "new tunnel must be live");
        assert_eq!(sup.health, HealthState::Unhealthy);

        let status = sup.status.read().await.clone();
        assert_eq!(status.active_node.as_deref(), Some(second_node.as_str()));
        assert_eq!(status.health, HealthState::Unhealthy);
        drop(status);

        sup.shutdown().await;
        assert!(!process_alive(second_pid));
    }

    #[tokio::test]
    async fn test_transition_is_reported_once_per_flip() {
        let dir = TempDir::new().unwrap();
        let script = stub_tsh(&dir, &["node-a"]);
        let settings = test_settings(script.to_str().unwrap());
        let inventory = NodeInventory::from_settings(&settings);
        let mut ports = PortAllocator::new(42050);

        let mut sup = Supervisor::new(
            &installation("gremlin", "gremlin.example.com"),
            &settings,
            &mut ports,
            &inventory,
        )
        .await
        .unwrap();

        // First probe always counts as a transition.
        assert!(sup.record_probe(&probe_failure()));
        // Repeated failures do not.
        assert!(!sup.record_probe(&probe_failure()));
        assert!(!sup.record_probe(&probe_failure()));
        // Recovery flips exactly once.
        assert!(sup.record_probe(&probe_success(200)));
        assert!(!sup.record_probe(&probe_success(204)));
        assert_eq!(sup.health, HealthState::Healthy);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_proxy_without_tunnel() {
        let dir = TempDir::new().unwrap();
        // Listing works, but the tunnel subcommand exits before spawn can
        // fail, so simulate a missing binary by swapping it after listing.
        let script = stub_tsh(&dir, &["node-a", "node-b"]);
        let settings = test_settings(script.to_str().unwrap());
        let inventory = NodeInventory::from_settings(&settings);
        let mut ports = PortAllocator::new(42060);

        let mut sup = Supervisor::new(
            &installation("gremlin", "gremlin.example.com"),
            &settings,
            &mut ports,
            &inventory,
        )
        .await
        .unwrap();
        sup.shutdown().await;

        // Point the tunnel at a nonexistent binary and fail over: the launch
        // fails, the proxy stays tunnel-less, and no panic occurs.
        sup.tunnel = Tunnel::new("/nonexistent/definitely-not-tsh");
        sup.failover().await;
        assert!(!sup.tunnel.is_live());
        assert!(sup.active_node.is_none());
    }
}
