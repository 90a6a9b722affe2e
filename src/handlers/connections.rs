use crate::middleware::RequireKeyAuth;
use crate::types::credential::{AccessToken, ConnectionSummary};
use crate::types::provider::Provider;
use crate::{KeeperError, router::KeeperState};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::{Value, json};

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// GET /users/{user_id}/connections
pub async fn list_connections(
    _auth: RequireKeyAuth,
    State(state): State<KeeperState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ConnectionSummary>>, KeeperError> {
    Ok(Json(state.handle.connections(&user_id).await?))
}

/// POST /users/{user_id}/connections/{provider}/token
pub async fn issue_token(
    _auth: RequireKeyAuth,
    State(state): State<KeeperState>,
    Path((user_id, provider)): Path<(String, String)>,
) -> Result<Json<AccessToken>, KeeperError> {
    let provider: Provider = provider.parse()?;
    Ok(Json(state.handle.get_valid_token(&user_id, provider).await?))
}

/// DELETE /users/{user_id}/connections/{provider}
pub async fn disconnect(
    _auth: RequireKeyAuth,
    State(state): State<KeeperState>,
    Path((user_id, provider)): Path<(String, String)>,
) -> Result<StatusCode, KeeperError> {
    let provider: Provider = provider.parse()?;
    state.handle.disconnect(&user_id, provider).await?;
    Ok(StatusCode::NO_CONTENT)
}
