use clap::{Parser, Subcommand};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dragnet::bus::spawn_bus_subscriber;
use dragnet::collector::{CollectorConfig, spawn_collector};
use dragnet::config::{AppConfig, load_kit_seeds};
use dragnet::kit_client::KitClient;
use dragnet::kits_repo::KitsRepository;
use dragnet::registry::KitRegistry;
use dragnet::supervisor::spawn_supervisor;
use dragnet::web::{AppState, start_web_server};
use dragnet::writer::{PersistenceWriter, join_writer, spawn_writer};
use dragnet::{db, metrics as app_metrics};

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_STORE_UNREACHABLE: i32 = 2;
const EXIT_SIGNALLED: i32 = 130;

#[derive(Parser)]
#[command(
    name = "dragnet",
    about = "WarDragon fleet analytics: telemetry ingestion, pattern detection, RSSI geolocation"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full server: ingestion, supervisor, and read API (default).
    Serve,
    /// Apply schema migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let pool = match db::create_pool(&config.database_url) {
        Ok(pool) => pool,
        Err(e) => {
            error!("Cannot reach the time-series store: {e:#}");
            std::process::exit(EXIT_STORE_UNREACHABLE);
        }
    };
    if let Err(e) = db::run_migrations(&pool) {
        error!("Schema migration failed: {e:#}");
        std::process::exit(EXIT_STORE_UNREACHABLE);
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            info!("Migrations applied");
        }
        Command::Serve => serve(config, pool).await,
    }
}

async fn serve(config: AppConfig, pool: db::PgPool) {
    info!(
        "Starting dragnet {}: poll every {:?}, stale/offline after {:?}/{:?}, \
         request timeout {:?}, batch size {}, path loss n={}",
        env!("CARGO_PKG_VERSION"),
        config.poll_interval,
        config.stale_after,
        config.offline_after,
        config.request_timeout,
        config.batch_size,
        config.path_loss_exponent,
    );

    let metrics_handle = app_metrics::init_metrics();
    app_metrics::initialize_ingest_metrics();

    let registry = KitRegistry::new(KitsRepository::new(pool.clone()));

    // Seed the fleet from the YAML kit list. A malformed file is a fatal
    // configuration error; add-if-missing keeps admin edits intact.
    if let Some(path) = &config.kits_file {
        let seeds = match load_kit_seeds(Path::new(path)) {
            Ok(seeds) => seeds,
            Err(e) => {
                error!("Kit list error: {e:#}");
                std::process::exit(EXIT_CONFIG_ERROR);
            }
        };
        match registry.seed_from_config(&seeds) {
            Ok(added) => info!("Kit list: {} entries, {added} newly seeded", seeds.len()),
            Err(e) => {
                error!("Kit seeding failed: {e:#}");
                std::process::exit(EXIT_STORE_UNREACHABLE);
            }
        }
    }
    if let Err(e) = registry.refresh() {
        error!("Cannot load kit registry: {e:#}");
        std::process::exit(EXIT_STORE_UNREACHABLE);
    }
    {
        let kits = registry.kits();
        let pollable = kits.iter().filter(|k| k.pollable()).count();
        info!(
            "Registry loaded: {} kits ({pollable} pollable via HTTP), bus {}",
            kits.len(),
            if config.mqtt.is_some() { "enabled" } else { "disabled" },
        );
    }

    let kit_client = match KitClient::new(config.request_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("HTTP client init failed: {e:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let cancel = CancellationToken::new();
    let writer = PersistenceWriter::new(pool.clone(), config.batch_size);
    let (writer_handle, writer_task) = spawn_writer(writer);

    let collector_task = spawn_collector(
        registry.clone(),
        kit_client.clone(),
        writer_handle.clone(),
        KitsRepository::new(pool.clone()),
        CollectorConfig {
            poll_interval: config.poll_interval,
            backoff_cap: config.backoff_cap,
            max_retries: config.max_retries,
            stale_after: config.stale_after,
            offline_after: config.offline_after,
        },
        cancel.clone(),
    );

    let bus_task = config.mqtt.clone().map(|mqtt| {
        spawn_bus_subscriber(mqtt, registry.clone(), writer_handle.clone(), cancel.clone())
    });

    let supervisor_task = spawn_supervisor(
        registry.clone(),
        config.stale_after,
        config.offline_after,
        config.poll_interval.max(Duration::from_secs(5)),
        cancel.clone(),
    );

    // Queue-depth and pool-state reporter.
    let reporter_handle = writer_handle.clone();
    let reporter_pool = pool.clone();
    let reporter_cancel = cancel.clone();
    let reporter_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = reporter_cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let depth = reporter_handle.queue_depth();
            metrics::gauge!("dragnet.writer.queue_depth").set(depth as f64);
            if depth > dragnet::writer::WRITE_QUEUE_SIZE / 2 {
                warn!("Writer queue building up: {depth} pending batches");
            }
            let state = reporter_pool.state();
            metrics::gauge!("dragnet.db_pool.connections").set(state.connections as f64);
            metrics::gauge!("dragnet.db_pool.idle_connections")
                .set(state.idle_connections as f64);
        }
    });

    let app_state = AppState::new(
        pool,
        config.clone(),
        registry,
        kit_client,
        metrics_handle,
    );
    let web_cancel = cancel.clone();
    let bind = config.http_bind.clone();
    let port = config.http_port;
    let web_task =
        tokio::spawn(async move { start_web_server(app_state, &bind, port, web_cancel).await });

    // Block until a shutdown signal, then cancel every task at its next
    // suspension point and drain the writer.
    let signalled = wait_for_shutdown_signal().await;
    info!("Shutting down: cancelling ingestion and draining writes");
    cancel.cancel();

    let _ = collector_task.await;
    if let Some(task) = bus_task {
        let _ = task.await;
    }
    let _ = supervisor_task.await;
    let _ = reporter_task.await;
    match web_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Web server error: {e:#}"),
        Err(e) => error!("Web server task panicked: {e}"),
    }

    // All producers are gone; the writer exits once the queue is empty.
    drop(writer_handle);
    join_writer(writer_task, Duration::from_secs(10)).await;

    info!("Shutdown complete");
    if signalled {
        std::process::exit(EXIT_SIGNALLED);
    }
}

/// Resolve on SIGINT or SIGTERM. Returns true when a signal (rather than
/// a handler registration failure) ended the wait.
async fn wait_for_shutdown_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Cannot install SIGTERM handler: {e}");
                return false;
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.is_ok(),
            _ = sigterm.recv() => true,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.is_ok()
    }
}
