//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

mod engine;

pub use engine::EngineMetrics;

/// Registry shared between the engine collectors and the exporter.
pub type SharedRegistry = Arc<Registry>;

/// Empty shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Serve `registry` at `/metrics` on `addr`. Binding happens before this
/// returns so a busy port fails engine start.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener")?;
    let addr = std_listener.local_addr().context("failed to read metrics address")?;
    let listener = TcpListener::from_std(std_listener).context("failed to register metrics listener")?;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server failed")
    });
    info!(address = %addr, "metrics exporter listening");

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

/// Text exposition of every metric family in `registry`.
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

async fn metrics_handler(State(registry): State<SharedRegistry>) -> Response {
    match render(&registry) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            error!(error = %err, "metrics scrape failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Running exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address; port 0 resolves to the assigned port.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for the server task.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("metrics server task panicked")?
    }
}
