//! portal-keeper
//!
//! Meant to be started by a scheduler. Each run makes sure this host is
//! logged in to the captive portal, and does nothing if another run is
//! still busy or the host is not on an allowed network.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pk_agent::{HttpPortalClient, ReconcileOutcome, Run, RunOutcome};
use pk_core::config::{self, PortalSettings};
use pk_core::lockfile;
use pk_core::network::{self, Eligibility};

const DOTENV_FILE: &str = ".env";

#[derive(Parser)]
#[command(name = "portal-keeper")]
#[command(about = "Keeps this host logged in to a captive portal")]
#[command(version)]
struct Args {
    /// Portal account name
    #[arg(short, long, env = "USERNAME")]
    username: Option<String>,

    /// Portal account password
    #[arg(short, long, env = "PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Portal base address, e.g. http://10.5.50.1
    #[arg(short, long, env = "BASE_URL")]
    base_url: Option<String>,

    /// Comma-separated allow-list of local networks (10.0.0.0/24,192.168.1.*)
    #[arg(short, long, env = "ALLOWED_IPS")]
    allowed_networks: Option<String>,

    /// Accept invalid TLS certificates from the portal
    #[arg(long, env = "PK_ACCEPT_INVALID_CERTS")]
    accept_invalid_certs: Option<bool>,

    /// User agent sent to the portal
    #[arg(long, env = "PK_USER_AGENT")]
    user_agent: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only report whether this host is on an allowed network
    #[arg(long)]
    check_network: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn settings(&self) -> PortalSettings {
        PortalSettings {
            username: self.username.clone(),
            password: self.password.clone(),
            base_url: self.base_url.clone(),
            allowed_networks: self.allowed_networks.clone(),
            accept_invalid_certs: self.accept_invalid_certs,
            user_agent: self.user_agent.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A .env in the working directory fills in unset variables
    let dotenv = dotenvy::from_path(Path::new(DOTENV_FILE));
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_ansi(std::io::stdout().is_terminal()))
        .init();

    match dotenv {
        Ok(()) => tracing::debug!("Loaded environment from {}", DOTENV_FILE),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!("Failed to load {}: {}", DOTENV_FILE, e),
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    tracing::info!("portal-keeper starting (PID {})", std::process::id());

    let config = load_settings(&args)?
        .validate()
        .context("Invalid configuration")?;

    if args.check_network {
        match network::check_eligibility(&config.allowed_networks) {
            Eligibility::Eligible { address, pattern } => {
                println!("eligible: {} matches {}", address, pattern);
            }
            Eligibility::Ineligible { addresses } => {
                println!(
                    "not eligible: {:?} vs {}",
                    addresses, config.allowed_networks_raw
                );
            }
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let lock_path = lockfile::default_lock_path();
    let outcome = Run::new(&config, &lock_path)
        .execute(network::local_ipv4_addrs, HttpPortalClient::new, shutdown)
        .await?;

    match outcome {
        RunOutcome::Reconciled(report) => {
            let verdict = match report.outcome {
                ReconcileOutcome::AlreadyAuthenticated => "already authenticated".to_string(),
                ReconcileOutcome::LoggedIn => "logged in".to_string(),
                ReconcileOutcome::LoginFailed(cause) => format!("failed ({})", cause),
            };
            tracing::info!("Run finished in {:.1?}: {}", report.elapsed, verdict);
        }
        RunOutcome::LockHeld(_) | RunOutcome::Ineligible => {}
        RunOutcome::Interrupted => tracing::info!("Run interrupted"),
    }

    Ok(())
}

/// Merge the configuration file (if any) with environment and flags
fn load_settings(args: &Args) -> Result<PortalSettings> {
    let file = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                PortalSettings::default()
            })
        } else {
            PortalSettings::default()
        }
    };

    Ok(file.merge(args.settings()))
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        shutdown.cancel();
    });
}
