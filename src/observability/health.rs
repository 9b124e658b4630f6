//! Health check HTTP server
//!
//! `GET /health` returns the client's [`Health`] (200 when UP, 503 when
//! DOWN), `GET /metrics` the counter snapshot, `GET /live` a liveness probe.

use crate::health::{Health, HealthCheck};
use crate::observability::metrics::metrics;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    check: Arc<dyn HealthCheck>,
    port: u16,
}

impl HealthServer {
    pub fn new(check: Arc<dyn HealthCheck>, port: u16) -> Self {
        Self { check, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Route tree, separate from `serve` so it can be exercised in tests
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let check = self.check.clone();

        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let check = check.clone();
                async move {
                    let health = check.health().await;
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&health),
                        status_code(&health),
                    ))
                }
            });

        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().snapshot()));

        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        health_route.or(metrics_route).or(live_route)
    }

    /// Serve until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) -> SocketAddr {
        let (addr, server) = warp::serve(self.routes()).bind_with_graceful_shutdown(
            ([0, 0, 0, 0], self.port),
            async move { shutdown.cancelled().await },
        );
        tracing::info!(%addr, "Health server listening");
        server.await;
        addr
    }
}

fn status_code(health: &Health) -> StatusCode {
    if health.is_up() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
