use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use evh_core::HarvestRecord;
use evh_storage::{RecordSink, SqliteSink};
use evh_sync::HarvestConfig;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "evh")]
#[command(about = "Event listing harvester")]
struct Cli {
    /// Emit logs as JSON lines instead of compact text.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest both listing streams until exhausted, cancelled or capped.
    Harvest(HarvestArgs),
    /// Create the database file and schema.
    InitDb,
    /// Print stored row counts per table.
    Counts,
    /// Print every stored record as one JSON object per line.
    Export,
}

#[derive(Debug, Default, Args)]
struct HarvestArgs {
    /// Overrides EVH_TOPIC.
    #[arg(long)]
    topic: Option<String>,

    /// Overrides EVH_MAX_CYCLES.
    #[arg(long)]
    max_cycles: Option<u64>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; harvest runs until done");
        std::future::pending::<()>().await;
    }
}

async fn open_store(config: &HarvestConfig) -> Result<SqliteSink> {
    SqliteSink::open(&config.database_url)
        .await
        .with_context(|| format!("opening record store {}", config.database_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = HarvestConfig::from_env();
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }

    match cli.command.unwrap_or(Commands::Harvest(HarvestArgs::default())) {
        Commands::Harvest(args) => {
            if let Some(topic) = args.topic {
                config.topic = topic;
            }
            if args.max_cycles.is_some() {
                config.max_cycles = args.max_cycles;
            }
            let summary = evh_sync::run_harvest(&config, shutdown_signal()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::InitDb => {
            let mut store = open_store(&config).await?;
            store.close().await?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Counts => {
            let mut store = open_store(&config).await?;
            let counts = store.record_counts().await?;
            store.close().await?;
            println!(
                "webcasts={} summits_and_series={}",
                counts.webcasts, counts.summits_and_series
            );
        }
        Commands::Export => {
            let mut store = open_store(&config).await?;
            let webcasts = store.load_webcasts().await?;
            let summits_or_series = store.load_summits_or_series().await?;
            store.close().await?;

            let records = webcasts
                .into_iter()
                .map(HarvestRecord::Webcast)
                .chain(summits_or_series.into_iter().map(HarvestRecord::SummitOrSeries));
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
    }

    Ok(())
}
