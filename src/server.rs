// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Observability Endpoints
//!
//! `/metrics` renders the relay metrics in the prometheus text format and
//! `/health` reports the broker connection state.

use crate::{
    connection::{BrokerConnection, ConnectionState},
    metrics::Metrics,
};
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
struct ServerState {
    metrics: Arc<Metrics>,
    connection: BrokerConnection,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connection: &'static str,
}

/// Builds the `/metrics` and `/health` routes.
///
/// # Parameters
/// * `metrics` - Sink rendered in the prometheus text format
/// * `connection` - Connection whose state drives the health status
pub fn router(metrics: Arc<Metrics>, connection: BrokerConnection) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(ServerState {
            metrics,
            connection,
        })
}

async fn metrics_handler(State(state): State<ServerState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(err) => {
            error!(error = err.to_string(), "failure to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health_handler(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let connection = state.connection.state();

    let (code, status) = match connection {
        ConnectionState::Connected => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            connection: connection.as_str(),
        }),
    )
}

/// Serves `router` on `addr` until `cancel` fires.
pub async fn serve(addr: SocketAddr, router: Router, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connect, FakeBroker};

    #[tokio::test]
    async fn health_follows_connection_state() {
        let broker = FakeBroker::new();
        let (conn, metrics) = connect(&broker).await;
        let state = ServerState {
            metrics,
            connection: conn.clone(),
        };

        let (code, Json(body)) = health_handler(State(state.clone())).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.connection, "connected");

        conn.close().await.unwrap();

        let (code, Json(body)) = health_handler(State(state)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "degraded");
        assert_eq!(body.connection, "disconnected");
    }

    #[tokio::test]
    async fn metrics_are_rendered_as_text() {
        let broker = FakeBroker::new();
        let (conn, metrics) = connect(&broker).await;
        metrics.inc_messages_processed();

        let response = metrics_handler(State(ServerState { metrics, connection: conn })).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            PROMETHEUS_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn serve_stops_on_cancel() {
        let broker = FakeBroker::new();
        let (conn, metrics) = connect(&broker).await;
        let cancel = CancellationToken::new();

        let server = tokio::spawn(serve(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            router(metrics, conn),
            cancel.clone(),
        ));
        cancel.cancel();

        server.await.unwrap().unwrap();
    }
}
