//! HTTP binding lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the listener (so the
//! bound port can be advertised as a point of access before peers are
//! contacted), and `serve()` accepts connections until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    health_handler, liveness_handler, onem2m_handler, readiness_handler, AppState,
};
use super::middleware::with_http_layers;
use super::shutdown::ShutdownController;
use crate::service::RequestPipeline;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The HTTP server in front of a node's request pipeline.
pub struct NetworkModule {
    config: NetworkConfig,
    pipeline: RequestPipeline,
    cse_id: Arc<str>,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, pipeline: RequestPipeline, cse_id: &str) -> Self {
        Self {
            config,
            pipeline,
            cse_id: Arc::from(cse_id),
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Routes:
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - everything else: the oneM2M binding
    pub fn build_router(&self) -> Router {
        let state = AppState {
            pipeline: self.pipeline.clone(),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            cse_id: Arc::clone(&self.cse_id),
            start_time: Instant::now(),
        };

        let routes = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .fallback(onem2m_handler);
        with_http_layers(routes, &self.config).with_state(state)
    }

    /// Binds the listener; returns the bound port (OS-assigned for port 0).
    ///
    /// # Errors
    ///
    /// Invalid configuration, or the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        self.config.validate().context("invalid network configuration")?;
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "HTTP listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    ///
    /// # Errors
    ///
    /// `start()` was not called, TLS material cannot be loaded, or the
    /// server hits a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .context("start() must be called before serve()")?;
        let router = self.build_router();
        self.shutdown.set_ready();

        if let Some(tls) = &self.config.tls {
            serve_tls(listener, router, tls, shutdown).await?;
        } else {
            info!("serving plain HTTP");
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await?;
        }

        drain(&self.shutdown).await;
        Ok(())
    }
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &super::config::TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .context("failed to load TLS certificates")?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, "serving HTTPS");
    axum_server::from_tcp_rustls(std_listener, rustls)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

async fn drain(shutdown: &ShutdownController) {
    shutdown.trigger_shutdown();
    if shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("in-flight requests drained");
    } else {
        warn!(
            in_flight = shutdown.in_flight_count(),
            "drain timeout expired with requests still running"
        );
    }
}
