use log::{error, info};

use logos_relay::{RelayConfig, RelayError, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        error!("Relay failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), RelayError> {
    let config = RelayConfig::from_env()?;

    info!("Starting Logos Relay on {}", config.bind_addr);
    match &config.storage_path {
        Some(path) => info!("Durable store: RocksDB at {}", path.display()),
        None => info!("Durable store: in-memory (state is lost on restart)"),
    }
    if config.cache.enabled {
        info!(
            "Cache: in-process LRU, {} entries, TTL {:?}",
            config.cache.capacity, config.cache.ttl
        );
    } else {
        info!("Cache: disabled");
    }

    let server = RelayServer::new(config)?;
    server.run(shutdown_signal()).await
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
