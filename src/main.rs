//! fleet-ssh-proxy
//!
//! An SSH proxy that fronts ephemeral workload containers: authenticates
//! clients by realm (direct process access, app access by token, app access
//! by platform credentials), resolves the target instance through the
//! cluster state service, and bridges the session to the in-container
//! SSH daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use fleet_ssh_proxy::auth;
use fleet_ssh_proxy::config::ProxyConfig;
use fleet_ssh_proxy::ssh;

/// fleet-ssh-proxy - SSH access into cluster workloads
#[derive(Parser, Debug)]
#[command(name = "fleet-ssh-proxy", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/fleet-ssh-proxy/config.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = ProxyConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Load configuration
    let mut config = ProxyConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    // Fail fast on configuration errors. The messages are stable tokens
    // consumed by process supervisors.
    let host_key = match config.load_host_key() {
        Ok(key) => key,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = config.validate() {
        eprintln!("{err}");
        std::process::exit(1);
    }

    info!("Starting fleet-ssh-proxy");
    info!("  Listen address: {}", config.listen_addr);
    info!(
        "  Diego auth: {}, CF auth: {}",
        config.enable_diego_auth, config.enable_cf_auth
    );

    let dispatcher = auth::build_dispatcher(&config)?;

    ssh::run_server(Arc::new(config), host_key, dispatcher).await
}
