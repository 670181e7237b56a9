//! Twin API routes (service side)

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::SessionStateStore;
use crate::error::{Result, TwinError};
use crate::state::AppState;
use crate::twin::{ExpectedVersion, Patch, Section, Twin};

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: u64,
}

/// Create the twins router
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/:device_id",
            get(get_twin).put(register_device).delete(remove_device),
        )
        .route("/:device_id/desired", patch(update_desired))
        .route("/:device_id/reported", patch(update_reported))
}

/// Full twin for a device
async fn get_twin(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Twin>> {
    let twin = state.store().get_twin(&device_id).await?;
    Ok(Json(twin))
}

/// Register a device with an empty twin
async fn register_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<(StatusCode, Json<Twin>)> {
    state.store().register_device(&device_id).await?;
    let twin = state.store().get_twin(&device_id).await?;
    Ok((StatusCode::CREATED, Json(twin)))
}

/// Remove a device and forget its session watermark
async fn remove_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<StatusCode> {
    state.store().remove_device(&device_id).await?;
    state.sessions().remove(&device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Service-authored desired patch. `If-Match` carries the expected desired
/// version; a missing header skips the check.
async fn update_desired(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<VersionResponse>> {
    let expected = expected_version(&headers)?;
    let patch = Patch::from_value(Section::Desired, body)?;

    let version = state
        .store()
        .apply_desired_patch(&device_id, &patch, expected)
        .await?;

    tracing::debug!(device_id = %device_id, version, expected = %expected, "Desired patch accepted");
    Ok(Json(VersionResponse { version }))
}

/// Reported patch on behalf of a device
async fn update_reported(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<VersionResponse>> {
    let patch = Patch::from_value(Section::Reported, body)?;
    let version = state.store().apply_reported_patch(&device_id, &patch).await?;
    Ok(Json(VersionResponse { version }))
}

fn expected_version(headers: &HeaderMap) -> Result<ExpectedVersion> {
    match headers.get(header::IF_MATCH) {
        None => Ok(ExpectedVersion::Any),
        Some(value) => value
            .to_str()
            .map_err(|_| TwinError::BadRequest("If-Match must be ASCII".into()))?
            .parse(),
    }
}
