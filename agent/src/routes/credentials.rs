//! Credential refresh from the host application.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};

use crate::error::{AppError, Result};
use crate::identity::Credential;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/credentials", post(refresh_credential))
}

/// POST /credentials - Install a fresh credential and wake workers
/// waiting in `Unauthenticated`.
async fn refresh_credential(
    State(state): State<AppState>,
    Json(credential): Json<Credential>,
) -> Result<StatusCode> {
    if credential.token.trim().is_empty() {
        return Err(AppError::BadRequest("token must not be empty".into()));
    }
    state.identity.refresh(credential);
    Ok(StatusCode::NO_CONTENT)
}
