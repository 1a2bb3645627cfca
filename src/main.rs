use std::sync::Arc;

use clap::Parser;

use farmhand::cache::{CoordinationStore, RedisStore};
use farmhand::config::Config;
use farmhand::notify::Notifier;
use farmhand::scheduler::Generator;
use farmhand::scheduler::sweeper::Sweeper;
use farmhand::server::ws::ScanHub;
use farmhand::server::{self, AppState};
use farmhand::store::Store;

#[derive(Debug, Parser)]
#[command(name = "farmhand", version, about = "Job leasing backend for game-automation agents")]
struct Cli {
    /// Listen address (overrides ADDR).
    #[arg(long)]
    addr: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,

    /// Skip running schema migrations at startup.
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(addr) = cli.addr {
        config.addr = addr;
    }
    init_tracing(&config, cli.log_json);

    let store = Arc::new(Store::new(&config.database).await?);
    if cli.skip_migrations {
        tracing::info!("skipping schema migrations");
    } else {
        store.run_migrations().await?;
    }

    let cache: Arc<dyn CoordinationStore> = Arc::new(RedisStore::connect(&config.redis).await?);
    let hub = Arc::new(ScanHub::new());
    let notifier = Arc::new(Notifier::new());

    let generator = Arc::new(Generator::new(
        config.scheduler.clone(),
        Arc::clone(&store),
        Arc::clone(&cache),
    ));
    let generator_handle = generator.spawn();

    let sweeper = Arc::new(Sweeper::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&hub),
    ));
    let sweeper_handle = sweeper.spawn();

    let addr = config.addr.clone();
    let state = AppState {
        config: Arc::new(config),
        store,
        cache,
        hub,
        generator: Arc::clone(&generator),
        notifier,
    };

    server::serve(state, &addr, shutdown_signal()).await?;

    // Join the background loops before exiting.
    if let Some(handle) = generator_handle {
        handle.stop().await;
    }
    sweeper_handle.stop().await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        return;
    }
    tracing::info!("shutdown signal received");
}

fn init_tracing(config: &Config, force_json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let json = force_json || config.log_format.eq_ignore_ascii_case("json");
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
