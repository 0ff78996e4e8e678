use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use reliefsync_core::{CoreError, OperationId, Table};
use reliefsync_engine::{EngineError, MigrationResult, Migrator, SyncAdapter, SyncConfig};

#[derive(Parser)]
#[command(name = "reliefsync")]
#[command(about = "Incident data sync: legacy migration and remote store inspection", long_about = None)]
struct Cli {
    /// SQLite file backing the remote store (`:memory:` for a scratch store)
    #[arg(long, global = true)]
    remote: Option<String>,

    /// JSON export of the browser store
    #[arg(long, global = true)]
    legacy: Option<PathBuf>,

    /// Migration marker file
    #[arg(long, global = true)]
    marker: Option<PathBuf>,

    /// Log filter directives
    #[arg(long, global = true, env = "RELIEFSYNC_LOG", default_value = "reliefsync=info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether a migration is needed and how many rows each table holds
    Status,
    /// Copy the legacy export into the remote store
    Migrate {
        /// Print the migration result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the facilities of one operation
    Facilities { operation: OperationId },
}

fn init_tracing(directives: &str) {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("reliefsync=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

impl Cli {
    fn config(&self) -> Result<SyncConfig, EngineError> {
        let mut config = SyncConfig::from_env()?;
        if let Some(remote) = &self.remote {
            config.remote_path = remote.clone();
        }
        if let Some(legacy) = &self.legacy {
            config.legacy_export = legacy.clone();
        }
        if let Some(marker) = &self.marker {
            config.marker_path = Some(marker.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log);
    let config = cli.config()?;

    match cli.command {
        Commands::Status => status(&config).await,
        Commands::Migrate { json } => migrate(&config, json).await,
        Commands::Facilities { operation } => facilities(&config, operation).await,
    }
}

async fn status(config: &SyncConfig) -> Result<(), EngineError> {
    let remote = config.open_remote()?;
    for table in Table::ALL {
        println!("{:<24}{}", table.as_str(), remote.count(table)?);
    }
    let migrator = Migrator::new(remote, config.legacy_store());
    let needed = migrator.needs_migration().await?;
    println!("migration needed: {}", if needed { "yes" } else { "no" });
    Ok(())
}

async fn migrate(config: &SyncConfig, json: bool) -> Result<(), EngineError> {
    let remote = config.open_remote()?;
    let migrator = Migrator::new(remote, config.legacy_store());
    if !migrator.needs_migration().await? {
        info!(export = %config.legacy_export.display(), "remote already holds migrated data, re-running");
    }

    let result = migrator.migrate().await;
    if json {
        let text = serde_json::to_string_pretty(&result)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        println!("{text}");
    } else {
        print_summary(&result);
    }
    result.into_result().map(|_| ())
}

fn print_summary(result: &MigrationResult) {
    println!(
        "{} of {} records migrated in {} ms",
        result.records_migrated,
        result.records_processed,
        result.duration.as_millis()
    );
    for table in Table::ALL {
        println!("  {:<22}{}", table.as_str(), result.tables.get(table));
    }
    for error in &result.errors {
        warn!(%error, "record not migrated");
    }
}

async fn facilities(config: &SyncConfig, operation: OperationId) -> Result<(), EngineError> {
    let remote = Arc::new(config.open_remote()?);
    let adapter = SyncAdapter::new(remote, config.client_label.clone());
    adapter.initialize().await?;
    adapter.set_current_operation(operation).await?;

    for facility in adapter.facilities() {
        println!(
            "{}  {:<32}{:<16}{}",
            facility.id,
            facility.name,
            facility.facility_type.as_deref().unwrap_or("-"),
            facility.status.as_deref().unwrap_or("-"),
        );
    }
    adapter.shutdown().await;
    Ok(())
}
