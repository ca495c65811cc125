use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, StoreBackend};
use gatekeeper::http::{app, AdmissionLayer, AdmissionPolicy, BotPathResolver, HttpServer};
use gatekeeper::ratelimit::{CounterStore, MemoryStore, RatelimiterRegistry, RedisStore};

/// Distributed admission control for the public API.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "GATEKEEPER_CONFIG")]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the Redis URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Keep counters in process memory instead of Redis
    #[arg(long)]
    memory_store: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.http_addr = listen;
    }
    if let Some(url) = args.redis_url {
        config.store.redis_url = url;
    }
    if args.memory_store {
        config.store.backend = StoreBackend::Memory;
    }
    info!(http_addr = %config.server.http_addr, backend = ?config.store.backend, "Configuration loaded");

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => {
            Arc::new(RedisStore::connect(&config.store.redis_url, config.store.timeout()).await?)
        }
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_purge_task(store.clone(), config.store.purge_interval());
            store
        }
    };

    // Fails fast on invalid limiter settings, before any traffic is served.
    let registry = Arc::new(RatelimiterRegistry::new(
        config.limiters.registry_options(),
        store,
    )?);
    info!("Ratelimiters initialized");

    let admission = AdmissionLayer::new(
        registry,
        Arc::new(BotPathResolver::new(config.premium_set())),
        AdmissionPolicy {
            fail_open: config.server.fail_open,
            trust_forwarded_for: config.server.trust_forwarded_for,
        },
    );

    HttpServer::new(config.server.http_addr, app(admission))
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Gatekeeper stopped");
    Ok(())
}

/// Periodically drop expired windows from the in-memory store.
fn spawn_purge_task(store: Arc<MemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            debug!(purged, "Purge pass finished");
        }
    });
}

/// Resolve on Ctrl+C or SIGTERM. A handler that cannot be installed is
/// logged and simply never fires.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = received, "Draining in-flight requests before exit");
}
