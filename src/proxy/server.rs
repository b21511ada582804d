//! HTTP server front-end: router assembly and connection loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get},
    Router,
};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::error::ProxyError;
use crate::proxy::cache::CacheEngine;
use crate::proxy::config::ProxyConfig;
use crate::proxy::handlers;
use crate::proxy::monitor::ProxyMonitor;
use crate::proxy::security::SecurityGate;
use crate::proxy::throttle::ThrottleManager;
use crate::proxy::upstream::UpstreamClient;

/// Maximum accepted request body.
pub(crate) const MAX_REQUEST_BODY: usize = 100 * 1024 * 1024;

/// Shared per-worker context: references to the six core components.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub security: Arc<SecurityGate>,
    pub cache: Arc<CacheEngine>,
    pub throttle: Arc<ThrottleManager>,
    pub upstream: Arc<UpstreamClient>,
    pub monitor: Arc<ProxyMonitor>,
}

/// Running server instance.
pub struct AxumServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: SocketAddr,
}

impl AxumServer {
    /// Bind and start serving. Returns the server handle and the join
    /// handle of the accept loop.
    pub async fn start(
        state: AppState,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), ProxyError> {
        let app = Router::new()
            .route("/healthz", get(handlers::admin::health))
            .route("/admin/health", get(handlers::admin::health))
            .route("/admin/metrics", get(handlers::admin::metrics))
            .route(
                "/admin/cache",
                get(handlers::admin::cache_stats).delete(handlers::admin::clear_cache),
            )
            .route(
                "/admin/cache/:domain",
                delete(handlers::admin::clear_cache_domain),
            )
            .fallback(handlers::forward::proxy_handler)
            .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let addr = state.config.bind_address();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Config(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::Config(format!("local_addr: {e}")))?;

        tracing::info!("caching proxy listening on http://{}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let server_instance = Self {
            shutdown_tx: Some(shutdown_tx),
            local_addr,
        };

        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let service = TowerToHyperService::new(app.clone());

                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!("connection closed: {:?}", err);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("failed to accept connection: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("proxy server stopped listening");
                        break;
                    }
                }
            }
        });

        Ok((server_instance, handle))
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
