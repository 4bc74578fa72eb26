pub mod auth;
pub mod comments;
pub mod evaluation;
pub mod orgs;
pub mod requirements;

use axum::Json;
use serde_json::json;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}
