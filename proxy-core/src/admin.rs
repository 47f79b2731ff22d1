use crate::Result;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::info;

/// Shared state for metrics
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub tunnels: AtomicU64,
    pub replays: AtomicU64,
    pub selection_redirects: AtomicU64,
    pub session_mutations: AtomicU64,
    pub listings: AtomicU64,
    pub certificates_issued: AtomicU64,
    pub issuance_failures: AtomicU64,
    pub gateway_errors: AtomicU64,
    pub live_sessions: AtomicU64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub tunnels: u64,
    pub replays: u64,
    pub selection_redirects: u64,
    pub session_mutations: u64,
    pub listings: u64,
    pub certificates_issued: u64,
    pub issuance_failures: u64,
    pub gateway_errors: u64,
    pub live_sessions: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            tunnels: self.tunnels.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            selection_redirects: self.selection_redirects.load(Ordering::Relaxed),
            session_mutations: self.session_mutations.load(Ordering::Relaxed),
            listings: self.listings.load(Ordering::Relaxed),
            certificates_issued: self.certificates_issued.load(Ordering::Relaxed),
            issuance_failures: self.issuance_failures.load(Ordering::Relaxed),
            gateway_errors: self.gateway_errors.load(Ordering::Relaxed),
            live_sessions: self.live_sessions.load(Ordering::Relaxed),
        }
    }
}

pub fn admin_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(move || metrics_handler(metrics)))
}

pub async fn start_admin_server(address: &str, port: u16, metrics: Arc<Metrics>) -> Result<()> {
    let app = admin_router(metrics);

    let addr: SocketAddr = format!("{}:{}", address, port).parse().map_err(|e| {
        crate::error::ProxyError::Configuration(format!("Invalid admin address {}: {}", address, e))
    })?;
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        crate::error::ProxyError::Network(format!("Failed to bind admin port {}: {}", port, e))
    })?;

    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::ProxyError::Network(format!("Admin server failed: {}", e)))?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(metrics: Arc<Metrics>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = Metrics::default();
        metrics.replays.fetch_add(3, Ordering::Relaxed);
        metrics.live_sessions.fetch_add(1, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.replays, 3);
        assert_eq!(snapshot.live_sessions, 1);
        assert_eq!(snapshot.total_requests, 0);
    }

    #[tokio::test]
    async fn test_metrics_serialize_counter_names() {
        let metrics = Arc::new(Metrics::default());
        metrics.total_requests.fetch_add(2, Ordering::Relaxed);

        let Json(snapshot) = metrics_handler(metrics).await;
        let body = serde_json::to_string(&snapshot).unwrap();
        assert!(body.contains("\"total_requests\":2"));
        assert!(body.contains("certificates_issued"));
    }
}
