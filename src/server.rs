//! HTTP endpoints for health checks and bridge status.

use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, future::Future, net::SocketAddr, sync::Arc};
use tracing::{debug, info};

use crate::{pool::RelayPool, replay::ReplayTracker, subscriptions::SubscriptionKey};

struct HttpState {
    tracker: Arc<ReplayTracker>,
    pool: Arc<RelayPool>,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Response body for `/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    /// Last processed `created_at` per subscription, absent before the first event.
    pub watermarks: BTreeMap<String, Option<u64>>,
    /// Live connections held by the zap relay pool.
    pub pooled_relays: usize,
}

/// Collect watermarks for every known subscription.
pub async fn watermarks(tracker: &ReplayTracker) -> Result<BTreeMap<String, Option<u64>>> {
    let mut out = BTreeMap::new();
    for key in SubscriptionKey::ALL {
        out.insert(key.as_str().to_string(), tracker.current_watermark(key.as_str()).await?);
    }
    Ok(out)
}

/// Start an HTTP server exposing `/healthz` and `/status`.
pub async fn serve_http(
    addr: SocketAddr,
    tracker: Arc<ReplayTracker>,
    pool: Arc<RelayPool>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http listening");
    let state = Arc::new(HttpState { tracker, pool });
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz() -> Json<Health> {
    debug!("GET /healthz");
    Json(Health {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<Arc<HttpState>>) -> Result<Json<Status>, (StatusCode, String)> {
    let watermarks = watermarks(&state.tracker)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(Status {
        watermarks,
        pooled_relays: state.pool.live_count().await,
    }))
}
