use anyhow::Result;
use clap::{Parser, Subcommand};
use rbac_core::{config::Config, migration, server, telemetry};
use tracing::info;

/// RBAC Core - policy decisions and role assignment service
#[derive(Parser, Debug)]
#[command(name = "rbac-core", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Default)]
enum Command {
    /// Run the HTTP server and the cleanup scheduler
    #[default]
    Serve,
    /// Create the database, apply migrations and verify the bootstrap seed
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let prometheus_handle = telemetry::init(&config.telemetry)?;

    match args.command.unwrap_or_default() {
        Command::Migrate => {
            info!("Running migrations");
            migration::run_migrations(&config).await
        }
        Command::Serve => {
            info!(service = %config.telemetry.service_name, "Starting RBAC Core");
            info!("HTTP server listening on {}", config.http_addr());
            server::run(config, prometheus_handle).await
        }
    }
}
