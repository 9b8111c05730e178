use anyhow::{bail, Context, Result};
use chessfinder_core::Platform;
use chessfinder_storage::PgRecordStore;
use chessfinder_sync::{Engine, EngineConfig};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const DEFAULT_LOG_FILTER: &str =
    "warn,chessfinder_storage=info,chessfinder_sync=info,chessfinder_web=info,chessfinder_cli=info";

#[derive(Debug, Parser)]
#[command(name = "chessfinder-cli")]
#[command(about = "Mirror chess.com game history and search it by board position")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// HTTP API plus an in-process queue worker.
    Serve,
    /// Apply PostgreSQL migrations.
    Migrate,
    /// Download a profile's games and wait for every archive to finish.
    Download {
        user: String,
        #[arg(long, default_value = "CHESS_DOT_COM")]
        platform: Platform,
    },
    /// Search already downloaded games and wait for the scan to finish.
    Search {
        user: String,
        board: String,
        #[arg(long, default_value = "CHESS_DOT_COM")]
        platform: Platform,
    },
    /// Print a stored download or search job.
    Status {
        #[command(subcommand)]
        job: StatusTarget,
    },
}

#[derive(Debug, Subcommand)]
enum StatusTarget {
    Download { id: Uuid },
    Search { id: Uuid },
}

fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_json = matches!(
        std::env::var("CHESSFINDER_LOG_JSON").as_deref(),
        Ok("1" | "true" | "TRUE" | "True")
    );
    init_tracing(DEFAULT_LOG_FILTER, log_json);

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => chessfinder_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = EngineConfig::from_env();
            let Some(url) = config.database_url else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgRecordStore::connect(&url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Download { user, platform } => {
            let engine = Engine::from_config(EngineConfig::from_env()).await?;
            let started = engine.start_download(&user, platform).await?;
            let stats = engine.worker().drain().await?;
            tracing::info!(?stats, "download drained");
            print_json(&engine.download_status(started.download_id).await?)?;
        }
        Commands::Search {
            user,
            board,
            platform,
        } => {
            let engine = Engine::from_config(EngineConfig::from_env()).await?;
            let started = engine.start_search(&user, platform, &board).await?;
            engine.worker().drain().await?;
            print_json(&engine.search_status(started.search_id).await?)?;
        }
        Commands::Status { job } => {
            let engine = Engine::from_config(EngineConfig::from_env()).await?;
            match job {
                StatusTarget::Download { id } => print_json(&engine.download_status(id).await?)?,
                StatusTarget::Search { id } => print_json(&engine.search_status(id).await?)?,
            }
        }
    }

    Ok(())
}
