//! Prometheus scrape endpoint
//!
//! Serves the registry in text format on a configurable path. Runs on its own
//! task and only reads the registry, so scrapes never wait on the scheduler.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::SharedMetricsRegistry;

/// Build the router serving `registry` at `path`.
pub fn router(registry: SharedMetricsRegistry, path: &str) -> Result<Router> {
    if !path.starts_with('/') || path == "/" {
        bail!("Metrics path must start with '/' and not be the root: '{path}'");
    }

    let metrics_handler = move || {
        let registry = Arc::clone(&registry);
        async move { render(&registry) }
    };

    let banner = format!("flipflop metrics server\n\nGET {path} - Prometheus metrics endpoint\n");

    Ok(Router::new()
        .route(path, get(metrics_handler))
        .route("/", get(move || async move { banner })))
}

fn render(registry: &SharedMetricsRegistry) -> Response {
    match registry.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        }
    }
}

/// Bind `addr` and serve until `shutdown` is cancelled.
pub async fn serve(
    registry: SharedMetricsRegistry,
    addr: SocketAddr,
    path: String,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(registry, &path)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {addr}"))?;

    info!(addr = %addr, path = %path, "metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn shared() -> SharedMetricsRegistry {
        Arc::new(MetricsRegistry::new().unwrap())
    }

    #[test]
    fn test_router_rejects_relative_path() {
        assert!(router(shared(), "metrics").is_err());
    }

    #[test]
    fn test_router_rejects_root_path() {
        assert!(router(shared(), "/").is_err());
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = tokio::net::TcpStream::connect(addr).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let mut stream = stream.expect("metrics server never came up");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn free_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_banner_names_configured_path() {
        let addr = free_addr();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(
            shared(),
            addr,
            "/chaos/metrics".to_string(),
            shutdown.clone(),
        ));

        let response = http_get(addr, "/").await;
        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
        assert!(response.contains("GET /chaos/metrics"));
        assert!(!response.contains("GET /metrics"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_answers_scrape() {
        let registry = shared();
        registry.metrics().inc("scheduler", "sub_tick");

        let addr = free_addr();

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(
            Arc::clone(&registry),
            addr,
            "/metrics".to_string(),
            shutdown.clone(),
        ));

        let response = http_get(addr, "/metrics").await;

        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
        assert!(response.contains(r#"variable="sub_tick""#));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
