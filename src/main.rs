//! nodewatch server binary.

use std::sync::Arc;
use std::time::Duration;

use nodewatch::cache::SettingsCache;
use nodewatch::config::ServerConfig;
use nodewatch::hub::Hub;
use nodewatch::scheduler::MetricsScheduler;
use nodewatch::store::Store;
use nodewatch::web::{Server, Session, SessionManager};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("nodewatch=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("starting nodewatch {} on port {}...", env!("CARGO_PKG_VERSION"), cfg.http_port);
    tracing::info!("using database at {}", cfg.db_path);

    let store = Store::new(&cfg.db_path)?;
    tracing::info!("database initialized successfully");

    let cache = Arc::new(SettingsCache::new(store.clone()));
    spawn_cache_refresh(cache.clone(), cfg.settings_refresh_interval());

    let hub = Hub::new();
    let sessions = Arc::new(SessionManager::new());
    if let Some(token) = &cfg.admin_token {
        sessions.put(
            token,
            Session {
                account_id: "admin".to_string(),
                is_admin: true,
            },
        );
        tracing::info!("bootstrap admin session enabled");
    }

    let scheduler = Arc::new(MetricsScheduler::new(
        store.clone(),
        cfg.aggregate_interval(),
        cfg.cleanup_interval(),
    ));
    scheduler.start();

    let server = Server::new(cfg, store, cache, hub, sessions);
    server.start().await?;

    scheduler.stop().await;
    Ok(())
}

/// Periodically reload the settings cache so out-of-process writers are
/// picked up.
fn spawn_cache_refresh(cache: Arc<SettingsCache>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let cache = cache.clone();
            if let Err(err) = tokio::task::spawn_blocking(move || cache.refresh()).await {
                tracing::error!("settings refresh panicked: {err}");
            }
        }
    });
}
