use levelwatch::{
    channel::manager::{ChannelManager, spawn_heartbeat},
    channel::protocol::close_code,
    clock::{Clock, LiveClock},
    config::Config,
    logging,
    persist::{file::FileSnapshotStore, worker::FlushWorker},
    scrip::InMemoryScripDirectory,
    server::{AppState, router},
    session::{SessionId, registry::SessionRegistry, runner::SessionDeps},
};
use levelwatch_feed::client::{FeedClient, WebSocketConnector};
use std::{sync::Arc, time::Duration};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if std::env::var("LEVELWATCH_LOG_JSON").is_ok() {
        logging::init_json_logging();
    } else {
        logging::init_logging();
    }

    let config = match load_config() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            error!(%error, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Err(error) = run(config).await {
        error!(%error, "server terminated with error");
        std::process::exit(1);
    }
}

fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LEVELWATCH_CONFIG").ok());

    match path {
        Some(path) => Ok(Config::from_toml_file(std::path::Path::new(&path))?),
        None => Ok(Config::default()),
    }
}

async fn run(config: Arc<Config>) -> Result<(), Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(LiveClock::new(config.market.calendar()));
    let store = Arc::new(FileSnapshotStore::new(config.persistence.dir.clone()));

    let (flush, flush_task) = FlushWorker::spawn(
        store.clone(),
        config.persistence.flush_interval(),
        config.persistence.failure_threshold,
    );

    let connector = WebSocketConnector {
        url: config.feed.endpoint_url()?,
    };
    let (feed, feed_task) =
        FeedClient::<SessionId, _>::spawn(config.feed.feed_config(), connector);

    let scrip = Arc::new(InMemoryScripDirectory::new());

    let deps = SessionDeps {
        clock: clock.clone(),
        feed: feed.clone(),
        flush: flush.clone(),
        scrip: scrip.clone(),
        config: config.clone(),
    };
    let registry = SessionRegistry::new(deps, store);
    let sweeper = registry.spawn_sweeper();
    let square_off_timer = registry.spawn_square_off_timer();

    let manager = Arc::new(ChannelManager::new());
    let heartbeat = spawn_heartbeat(
        manager.clone(),
        clock.clone(),
        config.server.heartbeat_interval(),
    );

    let app = router(AppState {
        registry: registry.clone(),
        manager: manager.clone(),
        feed: feed.clone(),
        scrip,
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr).await?;
    info!(addr = %config.server.bind_addr, "levelwatch listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown signal received, draining");
    heartbeat.abort();
    square_off_timer.abort();
    sweeper.abort();
    manager.close_all(close_code::GOING_AWAY);
    registry.shutdown_all(Duration::from_secs(10)).await;
    feed.shutdown();
    flush.flush_now().await;
    drop(flush);
    let _ = tokio::time::timeout(Duration::from_secs(5), feed_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), flush_task).await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => error!(%error, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
