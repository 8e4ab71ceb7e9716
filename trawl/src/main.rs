use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trawl::config::Config;
use trawl::notify::Notifier;
use trawl::{executor, replay, scheduler, worker};
use trawl_core::{Data, IpBlacklist, Pipe};
use trawl_queue::Queue;
use trawl_store::{PgStore, PrintStore, Store};

const PIPES_DIR: &str = "./resources/pipes";

#[derive(Parser)]
#[command(name = "trawl")]
#[command(about = "Pipe-driven attack surface monitoring", long_about = None)]
struct Cli {
    /// Start the worker pools instead of the scheduler
    #[arg(long)]
    worker: bool,

    /// Load a single pipe file instead of the pipe directory
    #[arg(long)]
    single: Option<PathBuf>,

    /// File of CIDRs that assets must never resolve to
    #[arg(long, default_value = "./resources/ips-exclude.txt")]
    blacklist: PathBuf,

    /// Skip the database: read assets from stdin and print results
    #[arg(long = "noDb")]
    no_db: bool,

    /// Read assets from stdin and run them through every pipe
    #[arg(long)]
    stdin: bool,

    /// Directory where exhausted job payloads are dumped for replay
    #[arg(long = "saveFailed")]
    save_failed: Option<PathBuf>,

    /// Replay a dumped job payload
    #[arg(long)]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trawl=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let blacklist = Arc::new(IpBlacklist::load(&cli.blacklist).context("loading IP blacklist")?);

    let pipes = match &cli.single {
        Some(path) => vec![Pipe::load(path)?],
        None => Pipe::load_dir(Path::new(PIPES_DIR))?,
    };
    if pipes.is_empty() {
        anyhow::bail!("no pipes loaded");
    }
    info!(pipes = pipes.len(), "loaded pipe definitions");

    let config = Config::from_env();
    config.validate()?;

    let notifier = Notifier::new(config.slack_webhook.clone());

    if cli.stdin || cli.no_db {
        info!("reading assets from stdin");
        let store: Arc<dyn Store> = if cli.no_db {
            Arc::new(PrintStore)
        } else {
            connect_store(&config, &pipes).await?
        };
        return run_stdin(&pipes, store.as_ref(), &notifier).await;
    }

    if let Some(path) = &cli.replay {
        info!("replaying job");
        let store = connect_store(&config, &pipes).await?;
        return replay::run(path, store.as_ref(), &notifier).await;
    }

    let store = connect_store(&config, &pipes).await?;
    let queue = Queue::connect(&config.redis_addr)
        .await
        .context("connecting to redis")?;

    if cli.worker {
        info!("starting workers");
        worker::start(
            pipes,
            queue,
            store,
            blacklist,
            notifier,
            cli.save_failed.clone(),
        )
        .await;
    } else {
        info!("starting scheduler");
        scheduler::start(pipes, store, queue, config.scheduler_sleep).await;
    }

    Ok(())
}

async fn connect_store(config: &Config, pipes: &[Pipe]) -> Result<Arc<dyn Store>> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;
    let pool = trawl_store::postgres::connect(url)
        .await
        .context("connecting to database")?;

    let store = PgStore::new(pool);
    store
        .setup_schema(&Pipe::tables(pipes))
        .await
        .context("setting up schema")?;

    Ok(Arc::new(store))
}

/// Runs every asset read from stdin through each loaded pipe,
/// synchronously and without the queue.
async fn run_stdin(pipes: &[Pipe], store: &dyn Store, notifier: &Notifier) -> Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        for pipe in pipes {
            let data = Data {
                asset: line.to_string(),
                ..Default::default()
            };
            if let Err(err) = executor::process(pipe, &data, store, notifier).await {
                error!(pipe = %pipe.name, %err, "processing stdin asset failed");
            }
        }
    }

    Ok(())
}
