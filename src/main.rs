//! # Tenant Provisioner Entry Point

use anyhow::Context;
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use provisioner::{
    config::ConfigLoader,
    db::init_pool,
    server::{run_server, run_worker},
    telemetry::init_tracing,
};

#[derive(Parser)]
#[command(name = "provisioner", about = "Tenant registration and site provisioning", version)]
struct Cli {
    /// Directory holding the layered `.env` files
    #[arg(long)]
    env_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply migrations, then run the HTTP API and the provision worker
    Serve,
    /// Apply pending migrations and exit
    Migrate,
    /// Run only the provision worker
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loader = match cli.env_dir {
        Some(dir) => ConfigLoader::with_base_dir(dir),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("Failed to load configuration")?;

    init_tracing(&config).context("Failed to initialize tracing")?;
    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = init_pool(&config).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            Migrator::up(&db, None)
                .await
                .context("Failed to apply migrations")?;
            run_server(config, db).await
        }
        Commands::Migrate => {
            Migrator::up(&db, None)
                .await
                .context("Failed to apply migrations")?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Commands::Worker => run_worker(config, db).await,
    }
}
