//! HTTP control surface.
//!
//! ## Endpoints
//!
//! - `POST /vm` - create a VM, `{ "sshPubKey", "image"? }` -> `{ "id", "ipAddress" }`
//! - `GET /vm` - list VMs
//! - `GET /vm/{id}` - one VM
//! - `DELETE /vm/{id}` - stop and forget a VM
//! - `GET /health` - health check

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use provision::{CreateVmRequest, Supervisor, VmError, VmInstance};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateVmBody {
    ssh_pub_key: String,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateVmResponse {
    id: String,
    ip_address: String,
}

/// Error body returned to API callers: `{ "error": message }`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Caller-facing form of a supervisor error; details stay in the log.
    fn from_vm(e: &VmError) -> Self {
        let status = match e {
            VmError::InvalidState { .. } => StatusCode::CONFLICT,
            VmError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ if e.is_bad_request() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.client_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/vm", get(list_vms).post(create_vm))
        .route("/vm/{id}", get(get_vm).delete(delete_vm))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_vms(State(supervisor): State<Arc<Supervisor>>) -> Json<Vec<VmInstance>> {
    Json(supervisor.list())
}

async fn get_vm(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> Result<Json<VmInstance>, ApiError> {
    supervisor
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("vm {id} not found")))
}

// Create and delete run on their own task so a dropped connection cannot
// abandon a half-provisioned VM.

async fn create_vm(
    State(supervisor): State<Arc<Supervisor>>,
    Json(body): Json<CreateVmBody>,
) -> Result<Json<CreateVmResponse>, ApiError> {
    if body.ssh_pub_key.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "sshPubKey is required"));
    }
    let request = CreateVmRequest {
        ssh_public_key: body.ssh_pub_key,
        image: body.image.filter(|i| !i.trim().is_empty()),
    };
    let instance = tokio::spawn(async move { supervisor.create_vm(request).await })
        .await
        .map_err(|e| {
            error!(error = %e, "create task failed");
            ApiError::internal("internal task failure")
        })?
        .map_err(|e| {
            error!(error = %e, "create vm request failed");
            ApiError::from_vm(&e)
        })?;

    Ok(Json(CreateVmResponse {
        id: instance.id,
        ip_address: instance
            .ip_address
            .map(|a| a.to_string())
            .unwrap_or_default(),
    }))
}

async fn delete_vm(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let result = tokio::spawn(async move { supervisor.delete_vm(&id).await })
        .await
        .map_err(|e| {
            error!(error = %e, "delete task failed");
            ApiError::internal("internal task failure")
        })?;
    match result {
        Ok(()) => Ok(StatusCode::OK),
        Err(VmError::NotFound { id }) => {
            warn!(id = %id, "delete of unknown vm");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => {
            error!(error = %e, "delete vm request failed");
            Err(ApiError::from_vm(&e))
        }
    }
}
