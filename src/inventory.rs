//! Backend node enumeration via the external `tsh ls` command.

use tokio::process::Command;

use crate::config::Settings;
use crate::error::InventoryError;

/// Lists the backend nodes eligible to terminate an installation's tunnel.
///
/// The lookup is a single external invocation; it is never retried here.
/// Retry policy belongs to the supervisor's probe loop.
#[derive(Debug, Clone)]
pub struct NodeInventory {
    binary: String,
    selector: String,
}

impl NodeInventory {
    pub fn new(binary: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            selector: selector.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.tsh_binary, &settings.node_selector)
    }

    /// The selector string for one installation.
    pub fn selector_for(&self, installation: &str) -> String {
        self.selector.replace("{name}", installation)
    }

    /// Returns the ordered node names for the installation.
    pub async fn list(&self, installation: &str) -> Result<Vec<String>, InventoryError> {
        let selector = self.selector_for(installation);
        let output = Command::new(&self.binary)
            .args(["ls", "--format=names"])
            .arg(&selector)
            .output()
            .await
            .map_err(|err| InventoryError::Unavailable {
                installation: installation.to_string(),
                reason: err.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(
                name = installation,
                exit_code = output.status.code().unwrap_or(-1),
                output = %stderr.trim(),
                "Node listing failed"
            );
            return Err(InventoryError::Unavailable {
                installation: installation.to_string(),
                reason: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let nodes: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        if nodes.is_empty() {
            return Err(InventoryError::NoNodesFound {
                installation: installation.to_string(),
            });
        }

        tracing::debug!(
            name = installation,
            count = nodes.len(),
            nodes = %nodes.join(", "),
            "Nodes for installation"
        );
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::stub_script;
    use tempfile::TempDir;

    #[test]
    fn test_selector_expands_name() {
        let inventory = NodeInventory::new("tsh", "ins={name},cluster={name},role=control-plane");
        assert_eq!(
            inventory.selector_for("gremlin"),
            "ins=gremlin,cluster=gremlin,role=control-plane"
        );
    }

    #[tokio::test]
    async fn test_list_parses_node_names() {
        let dir = TempDir::new().unwrap();
        let script = stub_script(&dir, "tsh", "echo node-a\necho node-b\necho node-c\n");

        let inventory = NodeInventory::new(script.to_str().unwrap(), "ins={name}");
        let nodes = inventory.list("gremlin").await.unwrap();
        assert_eq!(nodes, vec!["node-a", "node-b", "node-c"]);
    }

    #[tokio::test]
    async fn test_list_empty_output_is_no_nodes() {
        let dir = TempDir::new().unwrap();
        let script = stub_script(&dir, "tsh", "exit 0\n");

        let inventory = NodeInventory::new(script.to_str().unwrap(), "ins={name}");
        let err = inventory.list("gremlin").await.unwrap_err();
        assert!(matches!(err, InventoryError::NoNodesFound { .. }));
    }

    #[tokio::test]
    async fn test_list_nonzero_exit_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let script = stub_script(&dir, "tsh", "echo 'access denied' >&2\nexit 1\n");

        let inventory = NodeInventory::new(script.to_str().unwrap(), "ins={name}");
        let err = inventory.list("gremlin").await.unwrap_err();
        match err {
            InventoryError::Unavailable { reason, .. } => {
                assert!(reason.contains("access denied"));
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_missing_binary_is_unavailable() {
        let inventory = NodeInventory::new("/nonexistent/definitely-not-tsh", "ins={name}");
        let err = inventory.list("gremlin").await.unwrap_err();
        assert!(matches!(err, InventoryError::Unavailable { .. }));
    }
}
