use anyhow::{bail, Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::time::Duration;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tokio::sync::watch;

mod config;
mod dashboard;
mod error;
mod inventory;
mod pac;
mod probe;
mod registry;
mod session;
mod supervisor;
mod tunnel;

#[cfg(test)]
mod testutil;

use config::AppConfig;
use error::SessionError;
use pac::PacEntry;
use registry::Registry;

#[derive(Parser)]
#[command(
    name = "burrow",
    version,
    about = "SOCKS5 tunnels into private installations, with automatic browser proxy configuration"
)]
struct Cli {
    /// Config file (default: the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a starter config if missing
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Start the tunnels, probe loops, and PAC server
    Run {
        /// Show the live status dashboard instead of plain logs
        #[arg(long)]
        dashboard: bool,
    },
    /// Show session and installation status
    Status(OutputArgs),
    /// Print the PAC file that `run` would serve
    Pac,
    /// Validate the configuration and external tooling
    Check,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct OutputArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Tabled)]
struct InstallationRow {
    name: String,
    domain: String,
    port: u16,
    check_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::Init { force } => init_cmd(cli.config, force),
        Commands::Run { dashboard } => run_cmd(cli.config, dashboard).await,
        Commands::Status(args) => status_cmd(cli.config, args.json).await,
        Commands::Pac => pac_cmd(cli.config),
        Commands::Check => check_cmd(cli.config).await,
        Commands::Completions { shell } => {
            completions_cmd(shell);
            Ok(())
        }
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Invalid log level")?;
    // Logs go to stderr so the dashboard and PAC output own stdout.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn resolve_config_path(override_path: &Option<PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path.clone()),
        None => config::config_path(),
    }
}

fn load_config(override_path: &Option<PathBuf>) -> Result<(AppConfig, PathBuf)> {
    let path = resolve_config_path(override_path)?;
    let config = AppConfig::load_from(&path)?;
    Ok((config, path))
}

fn init_cmd(override_path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = resolve_config_path(&override_path)?;
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    AppConfig::sample().save_to(&path)?;
    println!("Wrote config to {}", path.display());
    println!("Edit it to list your installations, then run `burrow run`.");
    Ok(())
}

async fn run_cmd(override_path: Option<PathBuf>, show_dashboard: bool) -> Result<()> {
    let (config, path) = load_config(&override_path)?;
    if config.installations.is_empty() {
        bail!(
            "No installations configured. Add some to {} first.",
            path.display()
        );
    }

    preflight_session(&config.settings.tsh_binary).await;

    let registry = Registry::start(&config).await;
    if registry.is_empty() {
        bail!("No proxies could be started");
    }
    let board = registry.board();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut pac_task = tokio::spawn(pac::serve(
        board.clone(),
        config.settings.pac_port,
        shutdown_rx.clone(),
    ));
    let dashboard_task = show_dashboard.then(|| {
        tokio::spawn(dashboard::run(
            board,
            config.settings.pac_port,
            Duration::from_secs(config.settings.dashboard_refresh_secs),
            shutdown_rx,
        ))
    });

    let mut pac_outcome = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
        res = &mut pac_task => {
            pac_outcome = Some(res);
        }
    }

    let _ = shutdown_tx.send(true);
    registry.shutdown().await;
    if let Some(task) = dashboard_task {
        let _ = task.await;
    }

    match pac_outcome {
        None => {
            // Still serving; let the graceful shutdown finish.
            let _ = pac_task.await;
            Ok(())
        }
        Some(Ok(result)) => result,
        Some(Err(err)) => bail!("PAC server task panicked: {err}"),
    }
}

/// Check for an authenticated session before starting anything. A missing
/// session only warns: the proxies degrade on their own and recover once
/// the user logs in and the process is restarted.
async fn preflight_session(binary: &str) {
    match session::active_profile(binary).await {
        Ok(Some(profile)) => {
            tracing::info!(
                user = %profile.username,
                cluster = %profile.cluster,
                valid_until = ?profile.valid_until,
                "Active session found"
            );
        }
        Ok(None) | Err(SessionError::NotLoggedIn) => {
            tracing::warn!("No active session. Run `tsh login` or tunnels will stay down.");
        }
        Err(err) => {
            tracing::warn!(error = %err, "Session status check failed");
        }
    }
}

async fn status_cmd(override_path: Option<PathBuf>, json: bool) -> Result<()> {
    let (config, _) = load_config(&override_path)?;
    let session = session::active_profile(&config.settings.tsh_binary).await;

    let rows: Vec<InstallationRow> = config
        .installations
        .iter()
        .enumerate()
        .map(|(idx, inst)| InstallationRow {
            name: inst.name.clone(),
            domain: inst.domain.clone(),
            port: config.settings.base_proxy_port + idx as u16,
            check_url: inst.check_url(),
        })
        .collect();

    if json {
        let session_value = match &session {
            Ok(Some(profile)) => serde_json::json!({
                "logged_in": true,
                "username": profile.username,
                "cluster": profile.cluster,
                "valid_until": profile.valid_until,
            }),
            Ok(None) => serde_json::json!({ "logged_in": false }),
            Err(err) => serde_json::json!({
                "logged_in": false,
                "error": err.to_string(),
            }),
        };
        let installations: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "name": row.name,
                    "domain": row.domain,
                    "port": row.port,
                    "check_url": row.check_url,
                })
            })
            .collect();
        let payload = serde_json::json!({
            "session": session_value,
            "installations": installations,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    match &session {
        Ok(Some(profile)) => println!(
            "{} Logged in as {} on cluster {}",
            "✓".green(),
            profile.username,
            profile.cluster
        ),
        Ok(None) | Err(SessionError::NotLoggedIn) => {
            println!("{} Not logged in. Run `tsh login` first.", "✗".red())
        }
        Err(err) => println!("{} Session status unavailable: {}", "✗".red(), err),
    }
    println!();

    let mut table = Table::new(rows);
    table.with(Style::ascii());
    println!("{table}");
    Ok(())
}

fn pac_cmd(override_path: Option<PathBuf>) -> Result<()> {
    let (config, _) = load_config(&override_path)?;
    let entries: Vec<PacEntry> = config
        .installations
        .iter()
        .enumerate()
        .map(|(idx, inst)| PacEntry {
            domain: inst.domain.clone(),
            port: config.settings.base_proxy_port + idx as u16,
        })
        .collect();
    print!("{}", pac::render_pac(&entries));
    Ok(())
}

async fn check_cmd(override_path: Option<PathBuf>) -> Result<()> {
    let (config, path) = load_config(&override_path)?;
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.installations.is_empty() {
        errors.push("no installations configured".to_string());
    }

    let mut seen_names = std::collections::HashSet::new();
    let mut seen_domains = std::collections::HashSet::new();
    for inst in &config.installations {
        if inst.name.trim().is_empty() {
            errors.push("installation with empty name".to_string());
        } else if !seen_names.insert(inst.name.clone()) {
            errors.push(format!("duplicate installation name: {}", inst.name));
        }
        if inst.domain.trim().is_empty() {
            errors.push(format!("empty domain for installation {}", inst.name));
        } else if !seen_domains.insert(inst.domain.clone()) {
            warnings.push(format!("duplicate domain: {}", inst.domain));
        }
    }

    let first_port = config.settings.base_proxy_port as u32;
    let last_port = first_port + config.installations.len() as u32;
    if last_port > u16::MAX as u32 {
        errors.push(format!(
            "proxy port range {}..{} exceeds the valid port space",
            first_port, last_port
        ));
    }
    if (first_port..last_port).contains(&(config.settings.pac_port as u32)) {
        errors.push(format!(
            "PAC port {} collides with the proxy port range",
            config.settings.pac_port
        ));
    }

    let tsh_ok = tokio::process::Command::new(&config.settings.tsh_binary)
        .arg("version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !tsh_ok {
        errors.push(format!(
            "external tool not usable: {}",
            config.settings.tsh_binary
        ));
    }

    println!("Configuration: {}", path.display());
    for warning in &warnings {
        println!("  {} {}", "⚠".yellow(), warning);
    }
    for error in &errors {
        println!("  {} {}", "✗".red(), error);
    }
    if errors.is_empty() {
        println!("Configuration {}.", "valid".green());
        Ok(())
    } else {
        println!(
            "Configuration {}: {} error(s), {} warning(s)",
            "invalid".red(),
            errors.len(),
            warnings.len()
        );
        std::process::exit(1);
    }
}

fn completions_cmd(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "burrow", &mut std::io::stdout());
}
