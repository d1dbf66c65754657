//! envelope-keys: operator CLI for field encryption keys
//!
//! Configuration is loaded from environment variables (via .env file).
//!
//! Usage:
//!   envelope-keys crypto-init
//!   envelope-keys crypto-status [--json]
//!   envelope-keys dek-rotate-begin
//!   envelope-keys dek-rotate-run --new-label <L> [--batch-size N] [--until-done]
//!   envelope-keys dek-rotate-finalize --new-label <L>
//!   envelope-keys kek-rewrap --new-kek local:<base64>|kms:<resource>

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use envelope_fields::postgres_storage::{self, PgKeyCatalog, PgProtectedStore};
use envelope_fields::{EncryptionConfig, EncryptionService, EnvelopeError, KekSpec, KeyCatalog};

#[derive(Parser)]
#[command(
    name = "envelope-keys",
    version,
    about = "Key lifecycle operations for encrypted finance fields"
)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the first active DEK
    CryptoInit,

    /// Show key catalog and readiness
    CryptoStatus {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Start a DEK rotation; prints the new rotating label
    DekRotateBegin,

    /// Re-encrypt a batch of fields under the rotating key
    DekRotateRun {
        /// Label printed by dek-rotate-begin
        #[arg(long)]
        new_label: String,
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
        /// Keep running batches until nothing remains
        #[arg(long)]
        until_done: bool,
    },

    /// Retire the old key and make the rotating key active
    DekRotateFinalize {
        #[arg(long)]
        new_label: String,
    },

    /// Re-wrap every DEK under a new KEK
    KekRewrap {
        /// local:<base64 32-byte key> or kms:<key resource name>
        #[arg(long)]
        new_kek: String,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not found)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if cli.verbose {
        init_logging();
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e.downcast_ref::<EnvelopeError>().map(EnvelopeError::exit_code).unwrap_or(1);
        std::process::exit(code);
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "envelope_keys=debug,envelope_fields=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let database_url = cli
        .database_url
        .ok_or_else(|| EnvelopeError::Config("DATABASE_URL must be set".into()))?;
    let pool = postgres_storage::connect(&database_url).await?;
    postgres_storage::ensure_schema(&pool).await?;

    let catalog: Arc<dyn KeyCatalog> = Arc::new(PgKeyCatalog::new(pool.clone()));
    let service = match EncryptionConfig::from_env() {
        Ok(config) => {
            let protected = Arc::new(PgProtectedStore::new(pool, config.columns.clone()));
            EncryptionService::new(config, catalog, protected)
        }
        Err(e) => {
            let config = EncryptionConfig { enabled: true, ..EncryptionConfig::default() };
            EncryptionService::misconfigured(config, catalog, e.to_string())
        }
    };

    match cli.command {
        Commands::CryptoInit => {
            let key = service.orchestrator()?.init().await?;
            println!("initialized active key {}", key.origin_label);
        }
        Commands::CryptoStatus { json } => {
            let status = service.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status);
            }
            if let Some(reason) = status.not_ready_reason {
                return Err(EnvelopeError::NotReady(reason.to_string()).into());
            }
        }
        Commands::DekRotateBegin => {
            let label = service.orchestrator()?.rotate_begin().await?;
            println!("{}", label);
        }
        Commands::DekRotateRun { new_label, batch_size, until_done } => {
            let orchestrator = service.orchestrator()?;
            let progress = if until_done {
                orchestrator.rotate_run_until_done(&new_label, batch_size).await?
            } else {
                orchestrator.rotate_run(&new_label, batch_size).await?
            };
            println!("{}", progress);
            println!("remaining_count={}", progress.remaining);
        }
        Commands::DekRotateFinalize { new_label } => {
            let report = service.orchestrator()?.rotate_finalize(&new_label).await?;
            println!("active key is now {} (previous key {})", report.active_label, report.retired_label);
        }
        Commands::KekRewrap { new_kek } => {
            let spec = KekSpec::parse(&new_kek).context("invalid --new-kek")?;
            let provider = service.provider_from_spec(spec)?;
            let report = service.orchestrator()?.rewrap_kek(provider).await?;
            println!("{}", report);
            println!("processes configured with both the old and the new KEK keep working; switch KEK_MODE/KEK_LOCAL_KEY/KEK_KMS_KEY on the next deploy");
        }
    }
    Ok(())
}
