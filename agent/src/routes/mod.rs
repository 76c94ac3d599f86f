//! HTTP route definitions for the local control API.

mod alerts;
mod credentials;
mod devices;
mod health;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(devices::routes())
        .merge(alerts::routes())
        .merge(credentials::routes())
}
