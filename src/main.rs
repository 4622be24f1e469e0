#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use canvas_billing::billing::{decode_event, CreditReconciler, OrderPaid, WebhookEvent};
use canvas_billing::config::Config;
use canvas_billing::gateway;
use canvas_billing::store::SqliteStore;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "canvas-billing", version)]
#[command(about = "Credit reconciliation and dashboard API")]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Print a user's credit balance
    Balance { user_id: String },
    /// Deduct credits from a user
    Spend { user_id: String, amount: u32 },
    /// Apply a Polar webhook body read from disk
    Reconcile {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Create a user
    Add {
        /// User id (generated when omitted)
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long, default_value_t = 0)]
        credits: i64,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            config.validate()?;
            gateway::run_gateway(&config).await
        }
        Command::User {
            command:
                UserCommand::Add {
                    id,
                    name,
                    email,
                    credits,
                },
        } => {
            let store = SqliteStore::open(&config.database.path)?;
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let user = store.create_user(&id, name.as_deref(), email.as_deref(), credits)?;
            tracing::info!(user_id = %user.id, credits = user.credits, "User created");
            println!("{}", serde_json::to_string_pretty(&user)?);
            Ok(())
        }
        Command::Balance { user_id } => {
            let store = SqliteStore::open(&config.database.path)?;
            let user = store
                .get_user(&user_id)?
                .with_context(|| format!("User {user_id} not found"))?;
            println!("{}", user.credits);
            Ok(())
        }
        Command::Spend { user_id, amount } => {
            let store = SqliteStore::open(&config.database.path)?;
            let balance = store.deduct_credits(&user_id, amount)?;
            tracing::info!(user_id = %user_id, amount, balance, "Credits deducted");
            println!("{balance}");
            Ok(())
        }
        Command::Reconcile { file } => {
            let body = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let order = match decode_event(&body)
                .with_context(|| format!("Invalid webhook payload in {}", file.display()))?
            {
                WebhookEvent::OrderPaid(order) => OrderPaid::from(order),
                WebhookEvent::Other(kind) => {
                    println!("Ignored event type {kind}");
                    return Ok(());
                }
            };

            let store = Arc::new(SqliteStore::open(&config.database.path)?);
            let reconciler =
                CreditReconciler::new(store, config.catalog()?, config.billing.unknown_product);
            let outcome = reconciler.on_order_paid(&order)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
    }
}
