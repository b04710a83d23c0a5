//! The set of all proxy supervisors for the configured installations.

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::inventory::NodeInventory;
use crate::supervisor::{ProxyStatus, StatusCell, Supervisor};

/// Hands out local SOCKS5 ports, one per proxy, monotonically from a base.
///
/// Allocation happens sequentially at startup, before any probe loop runs,
/// so ports are stable for the process lifetime and the PAC script can rely
/// on them.
#[derive(Debug)]
pub struct PortAllocator {
    next: u16,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self { next: base }
    }

    pub fn allocate(&mut self) -> u16 {
        let port = self.next;
        self.next += 1;
        port
    }
}

struct ProxyHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Read-only snapshot access for the PAC handler and the dashboard.
///
/// Each cell is overwritten whole by its owning supervisor, so a clone is
/// always a consistent record; readers never see partial writes.
#[derive(Clone)]
pub struct StatusBoard {
    cells: Vec<StatusCell>,
}

impl StatusBoard {
    /// Board over premade cells, for tests that skip the registry.
    #[cfg(test)]
    pub(crate) fn for_testing(cells: Vec<StatusCell>) -> Self {
        Self { cells }
    }

    pub async fn snapshot(&self) -> Vec<ProxyStatus> {
        join_all(self.cells.iter().map(|cell| async move {
            cell.read().await.clone()
        }))
        .await
    }
}

/// All supervisors, one probe-loop task each.
pub struct Registry {
    handles: Vec<ProxyHandle>,
    board: StatusBoard,
}

impl Registry {
    /// Build one supervisor per configured installation and start its probe
    /// loop. A single installation failing to construct is logged and
    /// skipped; it never aborts the others.
    pub async fn start(config: &AppConfig) -> Self {
        let inventory = NodeInventory::from_settings(&config.settings);
        let mut ports = PortAllocator::new(config.settings.base_proxy_port);
        let mut handles = Vec::with_capacity(config.installations.len());
        let mut cells = Vec::with_capacity(config.installations.len());

        for installation in &config.installations {
            let supervisor =
                match Supervisor::new(installation, &config.settings, &mut ports, &inventory).await
                {
                    Ok(supervisor) => supervisor,
                    Err(err) => {
                        tracing::error!(
                            name = %installation.name,
                            error = %err,
                            "Skipping installation"
                        );
                        continue;
                    }
                };

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            cells.push(supervisor.status_cell());
            handles.push(ProxyHandle {
                name: installation.name.clone(),
                shutdown: shutdown_tx,
                task: tokio::spawn(supervisor.run(shutdown_rx)),
            });
        }

        Self {
            handles,
            board: StatusBoard { cells },
        }
    }

    /// Number of running proxies.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Signal every probe loop, then wait for each to finish its teardown.
    /// Best-effort per proxy: one failed teardown never blocks the rest.
    pub async fn shutdown(self) {
        for handle in &self.handles {
            let _ = handle.shutdown.send(true);
        }
        for handle in self.handles {
            if let Err(err) = handle.task.await {
                tracing::warn!(name = %handle.name, error = %err, "Proxy teardown failed");
            }
        }
        tracing::info!("All proxies stopped");
    }
}
