//! API server initialization

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, header};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::compression::CompressionLayer;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::core::config::AppConfig;
use crate::data::StorageService;

use super::auth::{BasicAuth, basic_auth_middleware};
use super::routes::storage::{StorageApiState, get_metric, get_metrics, get_status};

pub struct ApiServer {
    host: String,
    port: u16,
    auth: BasicAuth,
    state: StorageApiState,
}

impl ApiServer {
    pub fn new(config: &AppConfig, storage: Arc<StorageService>) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            auth: BasicAuth::from_config(&config.server),
            state: StorageApiState {
                storage,
                scraper_enabled: config.scraper.enabled,
                scraper_period_secs: config.scraper.period_secs,
            },
        }
    }

    /// Build the router. Split out so tests can drive it without a socket.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/storage/metrics", get(get_metrics))
            .route("/storage/metrics/{id}", get(get_metric))
            .route("/status", get(get_status))
            .with_state(self.state.clone())
            .layer(axum::middleware::from_fn_with_state(
                self.auth.clone(),
                basic_auth_middleware,
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            ))
            .layer(CompressionLayer::new())
    }

    /// Bind the listener and serve until the shutdown future resolves.
    pub async fn start(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<JoinHandle<()>> {
        let addr = SocketAddr::new(
            self.host
                .parse()
                .with_context(|| format!("invalid listen host: {}", self.host))?,
            self.port,
        );
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;

        tracing::info!(
            %addr,
            auth = self.auth.is_enabled(),
            "API server listening"
        );

        let app = self.router();
        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "API server error");
            }
            tracing::debug!("API server shutdown complete");
        }))
    }
}
