//! MT4/MT5 trade-replication broker.
//!
//! Accepts long-lived TCP connections from Controller and Prop EAs, pairs
//! them per user, and replays the Controller's trades onto every Prop
//! account in near real time.

mod broker;
mod collaborators;
mod config;
mod correlator;
mod db;
mod protocol;
mod registry;
mod replication;
mod router;
mod scheduler;
mod server;
mod wire;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::broker::Broker;
use crate::collaborators::{MemoryAccounts, MemoryAudit, MemorySettings};
use crate::config::BrokerConfig;
use crate::db::Database;

/// Trade-replication broker CLI.
#[derive(Parser)]
#[command(name = "copybroker")]
#[command(about = "Replicate Controller EA trades onto Prop EA accounts", long_about = None)]
struct Cli {
    /// Database URL; omit to run with in-memory state only
    #[arg(short, long, env = "DATABASE_URL")]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    Serve,

    /// Add a user to the account allow-list
    AddUser {
        /// User id the EAs will present in hello
        user_id: String,

        /// Optional display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show recent activity from the audit log
    Activity {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve => {
            let config = BrokerConfig::from_env();
            info!(
                port = config.tcp_port,
                auth = config.shared_secret.is_some(),
                "starting broker"
            );

            let broker = match &cli.database {
                Some(url) => {
                    let db = Arc::new(Database::new(url).await?);
                    Broker::new(config, db.clone(), db.clone(), db)
                }
                None => {
                    // Secretless dev mode: allow-list comes from the env.
                    let users: Vec<String> = std::env::var("ALLOWED_USERS")
                        .unwrap_or_default()
                        .split(',')
                        .filter(|u| !u.is_empty())
                        .map(str::to_string)
                        .collect();
                    info!(users = users.len(), "running without a database");
                    Broker::new(
                        config,
                        Arc::new(MemoryAccounts::with_users(users)),
                        Arc::new(MemorySettings::default()),
                        Arc::new(MemoryAudit::default()),
                    )
                }
            };
            broker.run().await
        }
        Commands::AddUser { user_id, name } => {
            let url = cli
                .database
                .ok_or_else(|| anyhow::anyhow!("--database is required for add-user"))?;
            let db = Database::new(&url).await?;
            db.upsert_account(&user_id, name.as_deref()).await?;
            println!("user {user_id} allowed");
            Ok(())
        }
        Commands::Activity { limit } => {
            let url = cli
                .database
                .ok_or_else(|| anyhow::anyhow!("--database is required for activity"))?;
            let db = Database::new(&url).await?;
            for (kind, user, detail) in db.recent_activity(limit).await? {
                println!("{kind:<16} {user:<12} {detail}");
            }
            Ok(())
        }
    }
}
