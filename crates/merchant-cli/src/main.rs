use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use merchant_core::{OfferQuery, SellerId, TaskId};
use merchant_storage::{MemoryOfferStore, OfferStore, PgOfferStore};
use merchant_sync::{IngestConfig, IngestPipeline, IngestRequest, RunMode, Submission};
use merchant_web::{AppState, TaskLogBody};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "merchant-cli")]
#[command(about = "Seller catalog ingestion service")]
struct Cli {
    /// Keep everything in process memory instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Serve,
    Migrate,
    /// Load one catalog and print the finished task log.
    Ingest { url: String, seller_id: SellerId },
    Status { task_id: TaskId },
    Offers {
        #[arg(long)]
        offer_id: Option<i64>,
        #[arg(long)]
        seller_id: Option<SellerId>,
        #[arg(long)]
        name: Option<String>,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn open_store(config: &IngestConfig, memory: bool) -> Result<Arc<dyn OfferStore>> {
    if memory {
        return Ok(Arc::new(MemoryOfferStore::new()));
    }
    let store = PgOfferStore::connect(&config.database_url, config.db_max_connections).await?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();
    let config = IngestConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let addr: SocketAddr = config
                .bind_addr
                .parse()
                .with_context(|| format!("parsing bind address {}", config.bind_addr))?;
            let store = open_store(&config, cli.memory).await?;
            let pipeline = Arc::new(IngestPipeline::from_config(&config, store)?);
            merchant_web::serve(addr, AppState::new(pipeline)).await?;
        }
        Commands::Migrate => {
            if cli.memory {
                bail!("migrate needs a Postgres store");
            }
            let store =
                PgOfferStore::connect(&config.database_url, config.db_max_connections).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Ingest { url, seller_id } => {
            let store = open_store(&config, cli.memory).await?;
            let pipeline = Arc::new(IngestPipeline::from_config(&config, store)?);
            let submission = pipeline
                .submit(IngestRequest {
                    url,
                    seller_id,
                    mode: RunMode::Inline,
                })
                .await?;
            match submission {
                Submission::Completed(log) => {
                    println!("{}", serde_json::to_string_pretty(&TaskLogBody::from(log))?)
                }
                Submission::Accepted(task_id) => println!("task {task_id} accepted"),
            }
        }
        Commands::Status { task_id } => {
            let store = open_store(&config, cli.memory).await?;
            match store.get_task_log(task_id).await? {
                Some(log) => println!("{}", serde_json::to_string_pretty(&TaskLogBody::from(log))?),
                None => bail!("incorrect task_id {task_id}"),
            }
        }
        Commands::Offers {
            offer_id,
            seller_id,
            name,
        } => {
            let store = open_store(&config, cli.memory).await?;
            let offers = store
                .find_offers(&OfferQuery {
                    offer_id,
                    seller_id,
                    name_contains: name,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&offers)?);
        }
    }

    Ok(())
}
