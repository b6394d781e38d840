//! Router assembly and the serving loop (§6).

use std::net::SocketAddr;

use axum::middleware;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::middleware as mw;
use crate::api::routes;
use crate::api::state::AppState;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
}

impl ApiConfig {
    pub fn from_listen_addr(listen_addr: &str) -> Result<Self> {
        let bind_addr = listen_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address {listen_addr}: {e}")))?;
        Ok(ApiConfig { bind_addr })
    }
}

pub struct ApiServer {
    config: ApiConfig,
    router: Router,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        let router = build_router(state);
        ApiServer { config, router }
    }

    pub fn addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {}: {e}", self.config.bind_addr)))?;
        tracing::info!(addr = %self.config.bind_addr, "api_server_listening");
        axum::serve(listener, self.router)
            .await
            .map_err(|e| Error::Config(format!("server error: {e}")))
    }

    /// Serves until `shutdown_signal` resolves, then returns once in-flight
    /// requests drain (§5 "Shutdown cancels all background tasks and awaits
    /// their completion with best-effort draining").
    pub async fn run_until<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {}: {e}", self.config.bind_addr)))?;
        tracing::info!(addr = %self.config.bind_addr, "api_server_listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| Error::Config(format!("server error: {e}")))
    }
}

fn build_router(state: AppState) -> Router {
    let max_body_size = state.config.max_body_size;

    let router = routes::api_router(state.clone())
        .layer(middleware::from_fn_with_state(state.clone(), mw::rate_limit_middleware))
        .layer(middleware::from_fn(mw::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    router.layer(RequestBodyLimitLayer::new(max_body_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_valid_listen_address() {
        let config = ApiConfig::from_listen_addr("127.0.0.1:8080").unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[test]
    fn rejects_an_invalid_listen_address() {
        assert!(ApiConfig::from_listen_addr("not-an-address").is_err());
    }
}
