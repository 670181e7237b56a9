//! Health check endpoints

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub database: &'static str,
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database_ok = sqlx::query("SELECT 1").execute(state.db()).await.is_ok();
    if !database_ok {
        tracing::warn!("Health check: database unreachable");
    }

    let status = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if database_ok { "healthy" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            service: "twin-sync",
            database: if database_ok { "ok" } else { "unreachable" },
        }),
    )
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}
