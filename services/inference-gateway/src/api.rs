//! HTTP surface for invocations and artifact lifecycle operations.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::artifact::{ArtifactInfo, StoreError, VersionId};
use crate::dispatcher::{DispatchError, PredictionRequest};
use crate::endpoint::{ActivationReport, EndpointError};
use crate::error::ErrorKind;
use crate::registry::{RegistryEntry, RegistryError};
use crate::Gateway;

#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self { Self { kind, message: message.into() } }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error_kind": self.kind.as_str(), "message": self.message }))).into_response()
    }
}

macro_rules! api_error_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ApiError {
            fn from(e: $ty) -> Self { ApiError::new(e.kind(), e.to_string()) }
        })*
    };
}

api_error_from!(StoreError, RegistryError, EndpointError, DispatchError);

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self { ApiError::new(ErrorKind::Internal, e.to_string()) }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub prediction: Value,
    pub version: VersionId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    pub code_ref: String,
    pub model_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivateRequest {
    pub version_id: VersionId,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/invocations", post(invoke))
        .route("/models/:name", get(model_entry))
        .route("/models/:name/artifacts", post(publish).get(list_artifacts))
        .route("/models/:name/activate", post(activate))
        .route("/models/:name/rollback", post(rollback))
        .route("/artifacts/:version_id", delete(delete_artifact))
        .with_state(gateway)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>, kind: ErrorKind) -> ApiResult<T> {
    payload.map(|Json(v)| v).map_err(|e| ApiError::new(kind, e.body_text()))
}

fn configured(gateway: &Gateway, name: &str) -> ApiResult<()> {
    if gateway.config.model(name).is_none() {
        return Err(ApiError::new(ErrorKind::UnknownModel, format!("model {name} is not configured")));
    }
    Ok(())
}

async fn invoke(State(gateway): State<Arc<Gateway>>, payload: Result<Json<PredictionRequest>, JsonRejection>) -> ApiResult<Json<InvocationResponse>> {
    let request = body(payload, ErrorKind::InvalidInput)?;
    let result = gateway.dispatcher.handle(request).await?;
    Ok(Json(InvocationResponse { prediction: result.prediction, version: result.version }))
}

async fn model_entry(State(gateway): State<Arc<Gateway>>, Path(name): Path<String>) -> ApiResult<Json<RegistryEntry>> {
    Ok(Json(gateway.registry.entry(&name)?))
}

async fn publish(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
    payload: Result<Json<PublishRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ArtifactInfo>)> {
    configured(&gateway, &name)?;
    let request = body(payload, ErrorKind::InvalidArtifact)?;
    let bytes = B64.decode(request.model_b64.as_bytes())
        .map_err(|e| ApiError::new(ErrorKind::InvalidArtifact, format!("model_b64: {e}")))?;
    let store = gateway.store.clone();
    let artifact = tokio::task::spawn_blocking(move || store.publish(&name, &bytes, &request.code_ref)).await??;
    Ok((StatusCode::CREATED, Json(artifact.info())))
}

async fn list_artifacts(State(gateway): State<Arc<Gateway>>, Path(name): Path<String>) -> ApiResult<Json<Vec<ArtifactInfo>>> {
    let store = gateway.store.clone();
    Ok(Json(tokio::task::spawn_blocking(move || store.list(&name)).await??))
}

async fn activate(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
    payload: Result<Json<ActivateRequest>, JsonRejection>,
) -> ApiResult<Json<ActivationReport>> {
    let request = body(payload, ErrorKind::InvalidInput)?;
    Ok(Json(gateway.manager.activate(&name, &request.version_id).await?))
}

async fn rollback(State(gateway): State<Arc<Gateway>>, Path(name): Path<String>) -> ApiResult<Json<ActivationReport>> {
    Ok(Json(gateway.manager.rollback(&name).await?))
}

async fn delete_artifact(State(gateway): State<Arc<Gateway>>, Path(version_id): Path<String>) -> ApiResult<StatusCode> {
    let store = gateway.store.clone();
    let version_id = VersionId::new(version_id);
    tokio::task::spawn_blocking(move || store.delete(&version_id)).await??;
    Ok(StatusCode::NO_CONTENT)
}
