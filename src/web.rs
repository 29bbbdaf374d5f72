// src/web.rs
//! Minimal embedded web server for the graph visualization UI.

use anyhow::{Context, Result};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tracing::info;

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Serve the embedded single-page UI on `addr` until interrupted.
pub async fn serve(addr: &str) -> Result<()> {
    let app = Router::new().route("/", get(index));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("serving graph UI on http://{addr}");
    axum::serve(listener, app)
        .await
        .context("web server failed")?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}
