//! Fleet Daemon - control plane for enrolled agents
//!
//! Serves the check-in API and provides local administration of enrollment
//! tokens and the agent directory.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fleet_daemon::auth::TokenRegistry;
use fleet_daemon::db::Database;
use fleet_daemon::directory::AgentDirectory;
use fleet_daemon::{Daemon, DaemonConfig};
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Definition
// ============================================================================

/// Fleet Daemon - agent enrollment and check-in service
#[derive(Parser)]
#[command(name = "fleet-daemon", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FLEET_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon server (default if no command given)
    Serve,

    /// Enrollment token management
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Agent directory management
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Create an enrollment token
    Create {
        /// Free-form note shown in `token list`
        #[arg(short, long, default_value = "")]
        description: String,

        /// Number of agents that may enroll with this token
        #[arg(short, long, default_value_t = 1)]
        max_uses: i64,

        /// Lifetime such as "30m", "24h" or "7d" (config default if omitted)
        #[arg(short, long)]
        expires_in: Option<String>,
    },

    /// List enrollment tokens
    List,
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List enrolled agents, newest first
    List,

    /// Show one agent and its device profile
    Show { id: String },

    /// Remove an agent from the directory
    Delete { id: String },
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Token { action }) => cmd_token(&config, action).await,
        Some(Commands::Agents { action }) => cmd_agents(&config, action).await,
        Some(Commands::Serve) | None => cmd_serve(config).await,
    }
}

/// Start the daemon server.
async fn cmd_serve(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "Starting fleet daemon"
    );

    let daemon = Daemon::open(config).await?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();
    let signal_task = tokio::spawn(async move {
        fleet_daemon::daemon::wait_for_signal().await;
        let _ = signal_tx.send(());
    });

    let result = daemon.serve(shutdown_tx).await;
    signal_task.abort();
    result?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Handle token subcommands.
async fn cmd_token(
    config: &DaemonConfig,
    action: TokenAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open(config.db_path()).await?;
    let tokens =
        TokenRegistry::new(db.pool().clone()).with_default_expiry(config.token_default_expiry());

    match action {
        TokenAction::Create {
            description,
            max_uses,
            expires_in,
        } => {
            let expires_in = expires_in.as_deref().map(parse_duration).transpose()?;
            let created = tokens
                .create_token(&description, max_uses, expires_in)
                .await?;

            println!("Enrollment Token Created");
            println!("========================");
            println!();
            println!("Token:    {}", created.token);
            println!("ID:       {}", created.id);
            println!("Max uses: {}", created.max_uses);
            match created.expires_at {
                Some(at) => println!("Expires:  {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Expires:  never"),
            }
            println!();
            println!("The token is shown only once. Share it with the agent out-of-band.");
        }
        TokenAction::List => {
            let list = tokens.list_tokens().await?;
            if list.is_empty() {
                println!("No enrollment tokens");
                return Ok(());
            }
            println!(
                "{:<36}  {:<9}  {:<20}  DESCRIPTION",
                "ID", "USES", "EXPIRES"
            );
            for token in list {
                let expires = token
                    .expires_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<36}  {:<9}  {:<20}  {}",
                    token.id,
                    format!("{}/{}", token.use_count, token.max_uses),
                    expires,
                    token.description
                );
            }
        }
    }
    Ok(())
}

/// Handle agent directory subcommands.
async fn cmd_agents(
    config: &DaemonConfig,
    action: AgentsAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open(config.db_path()).await?;
    let directory = AgentDirectory::new(db.pool().clone());

    match action {
        AgentsAction::List => {
            let agents = directory.list_agents().await?;
            if agents.is_empty() {
                println!("No agents enrolled");
                return Ok(());
            }
            println!(
                "{:<36}  {:<24}  {:<16}  {:<12}  LAST CHECK-IN",
                "ID", "HOSTNAME", "PLATFORM", "STATUS"
            );
            for agent in agents {
                let last = agent
                    .last_check_in
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<36}  {:<24}  {:<16}  {:<12}  {}",
                    agent.id, agent.hostname, agent.platform, agent.status, last
                );
            }
        }
        AgentsAction::Show { id } => {
            let Some(agent) = directory.get_agent(&id).await? else {
                return Err(format!("agent not found: {}", id).into());
            };
            println!("{}", serde_json::to_string_pretty(&agent)?);
            if let Some(profile) = directory.get_profile(&id).await? {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            }
        }
        AgentsAction::Delete { id } => {
            directory.delete_agent(&id).await?;
            println!("Deleted agent {}", id);
        }
    }
    Ok(())
}

/// Parse a duration string like "30m", "24h" or "7d".
fn parse_duration(s: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let s = s.trim();
    let (num_str, unit) = if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600)
    } else if let Some(n) = s.strip_suffix('d') {
        (n, 86400)
    } else {
        // Assume seconds if no unit
        (s, 1)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid duration: {}", s))?;
    if num == 0 {
        return Err(format!("Duration must be positive: {}", s).into());
    }
    Ok(Duration::from_secs(num.saturating_mul(unit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86400));
        assert!(parse_duration("0h").is_err());
        assert!(parse_duration("soon").is_err());
    }
}
