mod demo;
mod doctor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waterflow_core::config::EngineConfig;
use waterflow_core::event::EventBus;
use waterflow_core::policy::RetryPolicy;
use waterflow_core::types::FlowData;
use waterflow_engine::{CompletenessCalculator, FlowRegistry, RetryScheduler, RetryService};
use waterflow_graph::FlowStore;
use waterflow_store::SqliteStore;

#[derive(Parser)]
#[command(name = "waterflow", version, about = "Persistent dataflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "waterflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sample flows and print their completeness
    Demo,
    /// Report progress of persisted traces as JSON
    Completeness {
        /// Trace ids to report on
        #[arg(required = true)]
        trace_ids: Vec<String>,
    },
    /// Re-deliver retryable batches
    Retry {
        /// Run a single cycle and exit instead of the scheduler loop
        #[arg(long)]
        once: bool,
    },
    /// Check config and store health
    Doctor,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Everything a command needs, wired from config.
struct Engine {
    store: Arc<SqliteStore>,
    flow_store: FlowStore,
    registry: Arc<FlowRegistry>,
}

impl Engine {
    async fn open(config: &EngineConfig) -> anyhow::Result<Self> {
        let db_path = config.store_path();
        let store = Arc::new(SqliteStore::open(&db_path)?);
        info!(path = %db_path.display(), "Opened flow store");

        let flow_store = FlowStore {
            contexts: store.clone(),
            traces: store.clone(),
            retries: store.clone(),
            locks: Arc::new(
                store
                    .lock_provider()
                    .with_lease(Duration::from_secs(config.store.lock_lease_secs)),
            ),
            events: Arc::new(EventBus::new(config.events.capacity)),
            policy: RetryPolicy::from_config(&config.retry),
        };
        let registry = Arc::new(FlowRegistry::new(store.clone()));
        demo::register(&registry, &flow_store).await?;

        Ok(Self {
            store,
            flow_store,
            registry,
        })
    }

    fn calculator(&self) -> CompletenessCalculator {
        CompletenessCalculator::new(self.store.clone(), self.store.clone(), self.store.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("waterflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "waterflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
        EngineConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Doctor => {
            println!("Waterflow doctor");
            println!();
            doctor::run_doctor(&config);
        }
        Commands::Demo => {
            let engine = Engine::open(&config).await?;
            run_demo(&engine).await?;
        }
        Commands::Completeness { trace_ids } => {
            let engine = Engine::open(&config).await?;
            let report = engine.calculator().calculate(trace_ids).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Retry { once } => {
            let engine = Engine::open(&config).await?;
            let service = Arc::new(RetryService::new(
                engine.flow_store.clone(),
                engine.registry.clone(),
                config.retry.batch_limit,
            ));
            if once {
                let report = service.retry_jober().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down retry scheduler...");
                cancel_clone.cancel();
            });

            RetryScheduler::new(&config.retry, service, cancel)?.run().await;
        }
        // handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

async fn run_demo(engine: &Engine) -> anyhow::Result<()> {
    let mut trace_ids = Vec::new();
    for (stream, inputs) in [
        (demo::LINEAR_STREAM, demo::linear_inputs()),
        (demo::BRANCHING_STREAM, demo::branching_inputs()),
    ] {
        let flow = engine
            .registry
            .get(stream)
            .ok_or_else(|| anyhow::anyhow!("demo flow '{}' not registered", stream))?;
        let receipt = flow
            .offer(inputs.into_iter().map(FlowData::new).collect())
            .await?;
        info!(stream_id = %stream, trace_id = %receipt.trace_id, "Demo flow finished");
        trace_ids.push(receipt.trace_id);
    }

    let report = engine.calculator().calculate(trace_ids).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
