//! Alert history endpoints.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::store::AlertEntry;
use crate::AppState;

/// Default number of entries returned.
const DEFAULT_LIMIT: u32 = 50;

/// Maximum number of entries returned.
const MAX_LIMIT: u32 = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    /// Range start in ms since the epoch, inclusive
    pub from: Option<u64>,
    /// Range end in ms since the epoch, exclusive
    pub to: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearResponse {
    pub deleted: u64,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/alerts", get(list_alerts).delete(clear_alerts))
}

/// GET /alerts - Recent alerts, or those recorded in `[from, to)`.
async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<AlertEntry>>> {
    let entries = match (query.from, query.to) {
        (None, None) => {
            let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
            state.history.recent(limit).await?
        }
        (Some(from), to) => {
            let to = to.unwrap_or(u64::MAX >> 1);
            if to <= from {
                return Err(AppError::BadRequest("'to' must be after 'from'".into()));
            }
            state.history.between(from, to).await?
        }
        (None, Some(_)) => {
            return Err(AppError::BadRequest("'to' requires 'from'".into()));
        }
    };
    Ok(Json(entries))
}

/// DELETE /alerts - Clear the history.
async fn clear_alerts(State(state): State<AppState>) -> Result<Json<ClearResponse>> {
    let deleted = state.history.delete_all().await?;
    tracing::info!(deleted, "Alert history cleared");
    Ok(Json(ClearResponse { deleted }))
}
