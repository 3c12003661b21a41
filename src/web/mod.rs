//! HTTP and WebSocket edge.

mod auth;
mod handlers;
mod settings;
mod ws;

pub use auth::{Session, SessionManager};

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::SettingsCache;
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::store::Store;
use crate::version;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Store,
    pub cache: Arc<SettingsCache>,
    pub hub: Arc<Hub>,
    pub sessions: Arc<SessionManager>,
}

/// Web server for the monitoring edge.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        store: Store,
        cache: Arc<SettingsCache>,
        hub: Arc<Hub>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                cache,
                hub,
                sessions,
            },
        }
    }

    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route(
                "/api/nodes/{node_id}/health-history",
                get(handlers::handle_health_history),
            )
            .route(
                "/api/nodes/{node_id}/metrics",
                get(handlers::handle_node_metrics),
            )
            .route("/api/settings", get(settings::handle_list_settings))
            .route("/api/settings/version", get(settings::handle_settings_version))
            .route("/api/settings/batch", post(settings::handle_batch_update))
            .route(
                "/api/settings/{key}",
                get(settings::handle_get_setting)
                    .put(settings::handle_put_setting)
                    .delete(settings::handle_delete_setting),
            )
            .route("/api/monitor/ws", get(ws::handle_monitor_ws))
            .route("/api/version", get(handle_version))
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve until ctrl-c.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn handle_version() -> Response {
    Json(version::version_info()).into_response()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// JSON error body shared by every endpoint.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}
