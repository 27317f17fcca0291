//! License verification server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use keygate_core::{JsonFileStore, LicenseStore, SqliteStore, VerificationEngine};

use crate::api::{create_router, ApiState};
use crate::config::{ServerConfig, StoreBackend};
use crate::metrics::VerifyMetrics;
use crate::rate_limit::RateLimiter;

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// License verification server
pub struct LicenseServer {
    config: ServerConfig,
    engine: Arc<VerificationEngine>,
    rate_limiter: RateLimiter,
    metrics: Arc<VerifyMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl LicenseServer {
    /// Open the configured store and build the engine.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn LicenseStore> = match config.store_backend {
            StoreBackend::Json => Arc::new(JsonFileStore::open(&config.licenses_path).await?),
            StoreBackend::Sqlite => Arc::new(SqliteStore::new(&config.licenses_path).await?),
        };

        Self::with_store(config, store).await
    }

    /// Build a server around an already opened store.
    pub async fn with_store(config: ServerConfig, store: Arc<dyn LicenseStore>) -> Result<Self> {
        config.validate()?;

        // Reading every record up front surfaces a corrupt store at startup
        let snapshot = store.load_all().await?;
        info!(
            "Loaded {} licenses from {} ({:?} backend)",
            snapshot.len(),
            config.licenses_path.display(),
            config.store_backend
        );

        let metrics = Arc::new(VerifyMetrics::new()?);
        metrics.licenses_loaded.set(snapshot.len() as f64);

        let engine = Arc::new(VerificationEngine::new(store, config.engine_config()));
        let rate_limiter = RateLimiter::new(config.rate_limit_per_minute);
        let (shutdown_tx, _) = watch::channel(false);

        if engine.config().binding_required {
            info!("Hardware binding enabled");
        } else {
            info!("Hardware binding disabled, licenses are single-use");
        }

        Ok(Self {
            config,
            engine,
            rate_limiter,
            metrics,
            shutdown_tx,
        })
    }

    pub fn metrics(&self) -> &Arc<VerifyMetrics> {
        &self.metrics
    }

    /// The full application: routes plus tracing and CORS layers.
    pub fn router(&self) -> Router {
        let state = ApiState {
            engine: self.engine.clone(),
            rate_limiter: self.rate_limiter.clone(),
            metrics: self.metrics.clone(),
        };

        create_router(state).layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::very_permissive()),
        )
    }

    /// Run the server until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        info!("Starting license server on {}", self.config.listen_addr);

        let app = self.router();

        // Start eviction task
        if self.rate_limiter.is_enabled() {
            let rate_limiter = self.rate_limiter.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(Self::eviction_task(rate_limiter, shutdown_rx));
        }

        // Start HTTP server
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        info!("HTTP server listening on {}", listener.local_addr()?);

        let shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(Self::shutdown_signal(shutdown_rx))
            .await?;

        // Stop background tasks once the listener is gone
        let _ = self.shutdown_tx.send(true);
        info!("License server stopped");

        Ok(())
    }

    async fn eviction_task(rate_limiter: RateLimiter, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = rate_limiter.evict_idle();
                    if evicted > 0 {
                        debug!("Evicted {} idle rate limit buckets", evicted);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    match sigterm {
                        Some(ref mut sigterm) => {
                            sigterm.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = async {
                if *shutdown.borrow_and_update() {
                    return;
                }
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                std::future::pending::<()>().await;
            } => {
                info!("Shutdown requested");
            }
        }
    }

    /// Ask a running server to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
