//! Health check HTTP server for container orchestration
//!
//! Exposes the dispatcher's connectivity to operators and to the HTTP layer
//! that sits in front of it. Status is read from the transport on every
//! request, so there is nothing to keep in sync.

use crate::observability::metrics::metrics;
use crate::transport::mqtt::ConnectionState;
use crate::transport::Transport;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// HTTP health check server
pub struct HealthServer {
    service_id: String,
    port: u16,
    transport: Arc<dyn Transport>,
}

impl HealthServer {
    /// Create new health server
    pub fn new(service_id: String, port: u16, transport: Arc<dyn Transport>) -> Self {
        Self {
            service_id,
            port,
            transport,
        }
    }

    /// Build the route tree without binding a socket
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - connectivity plus dispatch status, 503 when down
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status();
                let status_code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&status),
                    status_code,
                ))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /ready - ready once the broker connection is up
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.transport.is_connected();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let status_code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&response),
                    status_code,
                ))
            }
        });

        // GET /live - process liveness
        let live_route = warp::path("live").and(warp::get()).and_then(|| async {
            let response = LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            };
            Ok::<_, Infallible>(warp::reply::json(&response))
        });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).and_then(|| async {
            let endpoints = HashMap::from([
                ("/health", "Connectivity and dispatch status"),
                ("/metrics", "Connection and dispatch counters"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
            ]);
            Ok::<_, Infallible>(warp::reply::json(&endpoints))
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
    }

    /// Start the HTTP health server
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        tracing::info!("Starting health server on port {}", port);
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let snapshot = metrics().get_metrics();
        let state = self.transport.connection_state();

        let mut checks = HashMap::new();
        checks.insert("mqtt".to_string(), Self::check_mqtt_health(&state, now));

        let healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            service_id: self.service_id.clone(),
            connection: state.to_string(),
            uptime_seconds: snapshot.uptime_seconds,
            commands_dispatched: snapshot.dispatch.commands_dispatched,
            checks,
        }
    }

    fn check_mqtt_health(state: &ConnectionState, now: u64) -> HealthCheck {
        match state {
            ConnectionState::Connected => HealthCheck {
                status: "healthy".to_string(),
                message: Some("MQTT connection established".to_string()),
                last_check: now,
            },
            ConnectionState::Connecting => HealthCheck {
                status: "unhealthy".to_string(),
                message: Some("MQTT handshake in progress".to_string()),
                last_check: now,
            },
            ConnectionState::Failed(reason) => HealthCheck {
                status: "unhealthy".to_string(),
                message: Some(format!("MQTT connection failed: {reason}")),
                last_check: now,
            },
            ConnectionState::Disconnected => HealthCheck {
                status: "unhealthy".to_string(),
                message: Some("MQTT disconnected".to_string()),
                last_check: now,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    service_id: String,
    connection: String,
    uptime_seconds: u64,
    commands_dispatched: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
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
