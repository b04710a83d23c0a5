use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_QUALIFIER: &str = "dev";
const APP_ORG: &str = "burrow";
const APP_NAME: &str = "burrow";

/// A private installation reachable through its own SOCKS5 tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    /// Common name of the installation, also used to build the node selector.
    pub name: String,
    /// Base domain whose traffic is routed through this installation's tunnel.
    pub domain: String,
}

impl Installation {
    /// Health endpoint probed through the tunnel to verify it is usable.
    pub fn check_url(&self) -> String {
        format!("https://happaapi.{}/healthz", self.domain)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Port the PAC file is served on.
    #[serde(default = "default_pac_port")]
    pub pac_port: u16,
    /// First local SOCKS5 port; each proxy takes the next one up.
    #[serde(default = "default_base_proxy_port")]
    pub base_proxy_port: u16,
    /// Interval between health probes in seconds.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Per-probe timeout in seconds (bounds the whole request).
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Dashboard refresh interval in seconds.
    #[serde(default = "default_dashboard_refresh_secs")]
    pub dashboard_refresh_secs: u64,
    /// External tool used for node listing, tunnels, and session status.
    #[serde(default = "default_tsh_binary")]
    pub tsh_binary: String,
    /// Selector passed to the node listing; `{name}` expands to the
    /// installation name.
    #[serde(default = "default_node_selector")]
    pub node_selector: String,
}

fn default_pac_port() -> u16 {
    9999
}

fn default_base_proxy_port() -> u16 {
    1080
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    20
}

fn default_dashboard_refresh_secs() -> u64 {
    2
}

fn default_tsh_binary() -> String {
    "tsh".to_string()
}

fn default_node_selector() -> String {
    "ins={name},cluster={name},role=control-plane".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pac_port: default_pac_port(),
            base_proxy_port: default_base_proxy_port(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            dashboard_refresh_secs: default_dashboard_refresh_secs(),
            tsh_binary: default_tsh_binary(),
            node_selector: default_node_selector(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub installations: Vec<Installation>,
    #[serde(default)]
    pub settings: Settings,
}

impl AppConfig {
    /// Starter configuration written by `burrow init`, meant to be edited.
    pub fn sample() -> Self {
        Self {
            installations: vec![Installation {
                name: "example".to_string(),
                domain: "example.com".to_string(),
            }],
            settings: Settings::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed reading config {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating config dir {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed writing config {}", path.display()))?;
        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .context("Could not determine config directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}
