//! HTTP API Server
//!
//! Client request/response contract plus status endpoints.

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::node::{ClientRequest, NodeHandle};
use crate::registry::NodeIdentity;
use crate::state::ElectionState;
use crate::error::{Error, Result};

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    node: NodeHandle,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node: NodeHandle) -> Self {
        Self { config, node }
    }

    /// Create the router
    pub fn router(node: NodeHandle) -> Router {
        Router::new()
            .route("/request", post(handle_request))
            .route("/status", get(handle_status))
            .route("/state", get(handle_state))
            .route("/coordinator", get(handle_coordinator))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(node)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);
        Self::serve(listener, self.node.clone()).await
    }

    /// Serve on an already bound listener
    pub async fn serve(listener: tokio::net::TcpListener, node: NodeHandle) -> Result<()> {
        axum::serve(listener, Self::router(node))
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))
    }
}

// ============ Response Types ============

/// Coordinator response
#[derive(Debug, Serialize)]
pub struct CoordinatorResponse {
    pub node_id: String,
    pub state: ElectionState,
    pub coordinator: Option<NodeIdentity>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub ready: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn unavailable(error: Error) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: error.to_string(),
            code: error.code().to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_request(State(node): State<NodeHandle>, Json(request): Json<ClientRequest>) -> Response {
    match node.request(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn handle_status(State(node): State<NodeHandle>) -> Response {
    match node.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn handle_state(State(node): State<NodeHandle>) -> Response {
    match node.state().await {
        Ok(state) => Json(state).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn handle_coordinator(State(node): State<NodeHandle>) -> Response {
    match node.status().await {
        Ok(status) => Json(CoordinatorResponse {
            node_id: status.node_id,
            state: status.state,
            coordinator: status.coordinator,
        })
        .into_response(),
        Err(e) => unavailable(e),
    }
}

async fn handle_health(State(node): State<NodeHandle>) -> Response {
    match node.status().await {
        Ok(status) => Json(HealthResponse {
            healthy: true,
            node_id: status.node_id,
            ready: status.ready,
        })
        .into_response(),
        Err(e) => unavailable(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryNetwork;
    use crate::node::{ClientResponse, Node, NodeSettings};
    use crate::registry::LocalRegistry;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_and_state_endpoints() {
        let network = MemoryNetwork::new();
        let inbound = network.attach("s1:5561").await;
        let registry = Arc::new(LocalRegistry::new(Duration::from_secs(30)));
        let (node, _task) = Node::spawn(
            NodeSettings::new("servidor_1", "s1:5561"),
            registry,
            Arc::new(network),
            inbound,
        )
        .await
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(HttpServer::serve(listener, node.clone()));

        let client = reqwest::Client::new();
        let response: ClientResponse = client
            .post(format!("{}/request", base))
            .json(&serde_json::json!({
                "service": "login",
                "payload": {"user": "alice"},
                "logicalClock": 3
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(response.is_ok());
        assert!(response.logical_clock > 3);

        let state: serde_json::Value = client
            .get(format!("{}/state", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(state["users"], serde_json::json!(["alice"]));

        let coordinator: serde_json::Value = client
            .get(format!("{}/coordinator", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(coordinator["coordinator"]["node_id"], "servidor_1");

        node.shutdown().await;
    }
}
