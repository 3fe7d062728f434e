//! Fleet Agent - enrolls with the daemon and checks in periodically

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_agent::credentials::CredentialStore;
use fleet_agent::state::AgentState;
use fleet_agent::transport::select_transport;
use fleet_agent::{Agent, AgentConfig, HostInspector};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Fleet Agent - host check-in and certificate lifecycle
#[derive(Parser)]
#[command(name = "fleet-agent", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FLEET_AGENT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Daemon address (overrides the config file)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Enrollment token for first contact
    #[arg(long, env = "FLEET_ENROLL_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Connect without TLS
    #[arg(long, global = true)]
    insecure: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (default if no command given)
    Run,

    /// Show the persisted identity and certificate
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = run(cli).await;

    if let Err(e) = &result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AgentConfig::load(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server_addr = server;
    }
    if cli.token.is_some() {
        config.enroll_token = cli.token;
    }
    if cli.insecure {
        config.insecure = true;
    }

    match cli.command {
        Some(Commands::Status) => cmd_status(&config),
        Some(Commands::Run) | None => cmd_run(config).await,
    }
}

async fn cmd_run(config: AgentConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = fleet_agent::runtime::AGENT_VERSION,
        server = %config.server_addr,
        insecure = config.insecure,
        "Starting fleet agent"
    );
    if config.insecure {
        tracing::warn!("TLS disabled, traffic to the daemon is unauthenticated");
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    let signal_task = tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    let result = Agent::new(config, HostInspector::new()).run(shutdown).await;
    signal_task.abort();
    result.context("Agent stopped")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn cmd_status(config: &AgentConfig) -> Result<()> {
    let state = AgentState::load(&config.state_path()).context("Failed to read agent state")?;
    let agent_id = if config.agent_id.is_empty() {
        state.agent_id
    } else {
        config.agent_id.clone()
    };
    let store = CredentialStore::from_config(config);

    println!("Server:      {}", config.server_addr);
    println!(
        "Agent ID:    {}",
        if agent_id.is_empty() { "(not enrolled)" } else { agent_id.as_str() }
    );
    println!("Cert dir:    {}", store.dir().display());
    println!("Transport:   {:?}", select_transport(config, &store));

    if store.has_identity() {
        let cert = store.load_certificate()?;
        let info = fleet_auth::parse_certificate(&cert).context("Failed to parse certificate")?;
        println!("Subject:     {}", info.subject_cn);
        println!("Issuer:      {}", info.issuer_cn);
        println!("Serial:      {}", info.serial_hex);
        println!("Expires:     {}", info.not_after);
    } else {
        println!("Certificate: none");
    }
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
