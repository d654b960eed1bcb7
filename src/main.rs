use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rategate::config::{GateConfig, LogFormat, LoggingConfig};
use rategate::gate::{AdminService, GateResponse, ResetRequest};
use rategate::ratelimit::{RateLimiter, Tier};

/// Tiered sliding-window rate limiter.
#[derive(Debug, Parser)]
#[command(name = "rategate", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON). `RATEGATE__*` variables override it.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record requests and print each decision with its response effects
    Check {
        #[arg(long)]
        identifier: String,
        #[arg(long, default_value = "free")]
        tier: String,
        #[arg(long, default_value = "general")]
        endpoint: String,
        /// Number of requests to record
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Clear a caller's history
    Reset {
        #[arg(long)]
        identifier: String,
        /// Endpoint class to clear; every class when omitted
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Print store usage
    Stats,
    /// Print the resolved policy table
    Policy,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rategate");

    let limiter = Arc::new(RateLimiter::from_config(&config).await?);
    let result = run(cli.command, &limiter).await;
    limiter.shutdown().await;
    result
}

async fn run(command: Command, limiter: &Arc<RateLimiter>) -> anyhow::Result<()> {
    match command {
        Command::Check {
            identifier,
            tier,
            endpoint,
            repeat,
        } => {
            let tier = Tier::from_name(&tier);
            for _ in 0..repeat {
                let decision = limiter.check_limit(&identifier, tier, &endpoint).await;
                let response = GateResponse::from_decision(&decision);
                println!(
                    "{}",
                    json!({ "decision": decision, "response": response })
                );
            }
        }
        Command::Reset {
            identifier,
            endpoint,
        } => {
            let admin = AdminService::new(Arc::clone(limiter));
            let response = admin
                .reset(&ResetRequest {
                    identifier,
                    endpoint_class: endpoint,
                })
                .await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            anyhow::ensure!(response.success, "reset failed");
        }
        Command::Stats => {
            let admin = AdminService::new(Arc::clone(limiter));
            let stats = admin.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Policy => {
            for (tier, class, limit) in limiter.policy().entries() {
                println!(
                    "{:<8} {:<9} max={:<5} window_ms={}",
                    tier, class, limit.max, limit.window_ms
                );
            }
        }
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_thread_ids(true).init(),
    }
}
