//! Axum HTTP server for the node daemon.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::extract::Request;
use axum::http::{header, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::daemon::handlers::{self, AppState};
use crate::error::{Error, Result};

const SERVER_HEADER: &str = concat!("Stove8s/", env!("CARGO_PKG_VERSION"));

/// Listen address of the daemon. The in-cluster daemonset exposes this as
/// node port 31008.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "::".to_string(),
            port: 8008,
        }
    }
}

async fn server_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(header::SERVER, HeaderValue::from_static(SERVER_HEADER));
    response
}

/// Build the daemon's router.
///
/// Handlers answer within the one-second timeout; the build+push work runs in
/// detached tasks and is not time-limited.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/oci",
            get(handlers::list_jobs).post(handlers::create_job),
        )
        .route("/oci/{id}", get(handlers::get_job))
        .route("/healthz", get(handlers::healthz))
        .layer(middleware::from_fn(server_header))
        .layer(TimeoutLayer::new(Duration::from_secs(1)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until SIGINT/SIGTERM.
pub async fn run_server(config: DaemonConfig, state: AppState) -> Result<()> {
    let ip: IpAddr = config
        .host
        .parse()
        .map_err(|e| Error::ConfigError(format!("invalid host {}: {e}", config.host)))?;
    let addr = SocketAddr::new(ip, config.port);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("failed to bind {addr}: {e}")))?;
    info!("stove8s daemon listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::ConfigError(format!("server error: {e}")))?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
