use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: ServiceHealth,
}

#[derive(Serialize)]
pub struct ServiceHealth {
    pub postgres: ComponentHealth,
    pub redis: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
}

impl ComponentHealth {
    fn ok(start: std::time::Instant) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            queue_depth: None,
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
            queue_depth: None,
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /healthz: store and broker connectivity.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let postgres = match state.store.ping().await {
        Ok(()) => ComponentHealth::ok(start),
        Err(e) => {
            tracing::warn!(error = %e, "PostgreSQL health check failed");
            ComponentHealth::error()
        }
    };

    let redis_start = std::time::Instant::now();
    let redis = match state.queue.ping().await {
        Ok(()) => {
            let mut health = ComponentHealth::ok(redis_start);
            match state.queue.depth().await {
                Ok(depth) => {
                    metrics::gauge!("crawl_queue_depth").set(depth as f64);
                    health.queue_depth = Some(depth);
                }
                Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
            }
            health
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis health check failed");
            ComponentHealth::error()
        }
    };

    let all_healthy = postgres.is_ok() && redis.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services: ServiceHealth { postgres, redis },
    };

    (status_code, Json(response))
}
