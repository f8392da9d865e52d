//! # EmberShard Control Plane
//!
//! The REST surface for operating models on a serving cluster: create a
//! model from a dumped checkpoint, list and inspect models, delete them,
//! and inspect the serving nodes. Long-running create/delete work runs on
//! a small controller pool off the request path.
//!
//! Error mapping follows the wire codes: `InvalidId` becomes 404, anything
//! else 403.

pub mod controller;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use embershard_core::{ApiConfig, PsError};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub use controller::{ModelController, NodeInfo};

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateModelRequest {
    pub model_uri: String,
    #[serde(default = "default_replica_num")]
    pub replica_num: i32,
    #[serde(default = "default_shard_num")]
    pub shard_num: i32,
}

fn default_replica_num() -> i32 {
    3
}

fn default_shard_num() -> i32 {
    -1
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(PsError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            PsError::InvalidId(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::FORBIDDEN,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<PsError> for ApiError {
    fn from(error: PsError) -> Self {
        ApiError(error)
    }
}

#[derive(Clone)]
struct AppState {
    controller: Arc<ModelController>,
}

/// The REST control plane server.
pub struct ControlPlane {
    config: ApiConfig,
    controller: Arc<ModelController>,
}

impl ControlPlane {
    pub fn new(config: ApiConfig, controller: Arc<ModelController>) -> Self {
        Self { config, controller }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            controller: Arc::clone(&self.controller),
        };
        let mut router = Router::new()
            .route("/models", post(create_model).get(list_models))
            .route("/models/:sign", get(show_model).delete(delete_model))
            .route("/nodes", get(list_nodes))
            .route("/nodes/:id", get(show_node).delete(delete_node))
            .with_state(state);
        if self.config.cors_enabled {
            router = router.layer(CorsLayer::permissive());
        }
        router
    }

    /// Bind the listener and serve in a background task.
    pub async fn start(&self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        info!(%addr, "starting control plane");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let router = self.router();
        tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, router).await {
                warn!(%error, "control plane server error");
            }
        });
        Ok(())
    }
}

async fn create_model(
    State(state): State<AppState>,
    Json(request): Json<CreateModelRequest>,
) -> Result<Response, ApiError> {
    let sign = state
        .controller
        .create_model(&request.model_uri, request.replica_num, request.shard_num)
        .await?;
    let body = state.controller.show_model(&sign)?;
    Ok((
        StatusCode::CREATED,
        [("Location", format!("/models/{sign}"))],
        Json(body),
    )
        .into_response())
}

async fn list_models(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(Json(state.controller.show_models()).into_response())
}

async fn show_model(
    State(state): State<AppState>,
    Path(sign): Path<String>,
) -> Result<Response, ApiError> {
    Ok(Json(state.controller.show_model(&sign)?).into_response())
}

async fn delete_model(
    State(state): State<AppState>,
    Path(sign): Path<String>,
) -> Result<Response, ApiError> {
    state.controller.delete_model(&sign)?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn list_nodes(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(Json(state.controller.show_nodes()).into_response())
}

async fn show_node(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Response, ApiError> {
    Ok(Json(state.controller.show_node(id)?).into_response())
}

async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Response, ApiError> {
    state.controller.delete_node(id)?;
    Ok(StatusCode::ACCEPTED.into_response())
}
