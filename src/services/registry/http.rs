use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::service::{RegistryError, RegistryService};
use super::ws::ws_registry_handler;
use crate::config::RegistryConfig;
use crate::models::{
    AckResponse, ChangesResponse, DiscoverResponse, HeartbeatRequest, HeartbeatResponse,
    RegisterRequest, RegisterResponse,
};

/// 注册中心 HTTP 层的共享状态
#[derive(Clone)]
pub struct RegistryState {
    pub registry: Arc<RegistryService>,
    pub config: RegistryConfig,
    pub shutdown: CancellationToken,
}

/// 构建注册中心的路由表
pub fn registry_router(state: RegistryState) -> Router {
    Router::new()
        .route("/api/registry/register", post(register_handler))
        .route(
            "/api/registry/deregister/{instance_id}",
            post(deregister_handler),
        )
        .route("/api/registry/heartbeat", post(heartbeat_handler))
        .route(
            "/api/registry/discover/{service_name}",
            get(discover_handler),
        )
        .route(
            "/api/registry/instance/{service_name}",
            get(instance_handler),
        )
        .route("/api/registry/services", get(services_handler))
        .route("/api/registry/instances", get(instances_handler))
        .route("/api/registry/changes", get(changes_handler))
        .route("/ws/registry", get(ws_registry_handler))
        .with_state(state)
}

impl RegistryError {
    fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::Validation(_) | RegistryError::BindingChanged(_) => {
                StatusCode::BAD_REQUEST
            }
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(AckResponse {
            success: false,
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

async fn register_handler(
    State(state): State<RegistryState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, RegistryError> {
    let instance_id = state.registry.register(req)?;
    Ok(Json(RegisterResponse {
        success: true,
        instance_id: Some(instance_id),
        message: "registered".to_string(),
    }))
}

async fn deregister_handler(
    State(state): State<RegistryState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<AckResponse>, RegistryError> {
    state.registry.deregister(&instance_id)?;
    Ok(Json(AckResponse {
        success: true,
        message: "deregistered".to_string(),
    }))
}

async fn heartbeat_handler(
    State(state): State<RegistryState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, RegistryError> {
    state
        .registry
        .heartbeat(&req.instance_id, &req.service_name)?;
    Ok(Json(HeartbeatResponse { success: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverQuery {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    healthy_only: Option<bool>,
}

async fn discover_handler(
    State(state): State<RegistryState>,
    Path(service_name): Path<String>,
    Query(query): Query<DiscoverQuery>,
) -> Json<DiscoverResponse> {
    let instances = state.registry.discover(
        &service_name,
        query.version.as_deref(),
        query.healthy_only.unwrap_or(false),
    );
    Json(DiscoverResponse {
        service_name,
        instances,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceQuery {
    #[serde(default)]
    version: Option<String>,
}

// 单实例查询走服务端的均匀选择
async fn instance_handler(
    State(state): State<RegistryState>,
    Path(service_name): Path<String>,
    Query(query): Query<InstanceQuery>,
) -> Response {
    match state.registry.pick(&service_name, query.version.as_deref()) {
        Some(record) => Json(record).into_response(),
        None => RegistryError::NotFound(format!(
            "no healthy instance for service '{}'",
            service_name
        ))
        .into_response(),
    }
}

async fn services_handler(State(state): State<RegistryState>) -> Json<Vec<String>> {
    Json(state.registry.list_names())
}

async fn instances_handler(
    State(state): State<RegistryState>,
) -> Json<Vec<crate::models::InstanceRecord>> {
    Json(state.registry.list_all())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangesQuery {
    #[serde(default)]
    since_version: u64,
}

async fn changes_handler(
    State(state): State<RegistryState>,
    Query(query): Query<ChangesQuery>,
) -> Json<ChangesResponse> {
    Json(state.registry.feed().changes_since(query.since_version))
}
