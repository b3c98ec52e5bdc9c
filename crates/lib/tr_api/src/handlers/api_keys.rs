//! API key management handlers. Session callers only.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tr_core::models::auth::ApiKey;

use crate::AppState;
use crate::error::AppResult;
use crate::middleware::auth::SessionAuth;

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    #[serde(default)]
    pub name: String,
}

/// Issuance response. This is the only response that ever contains a key's
/// plaintext; it cannot be retrieved again.
#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    #[serde(flatten)]
    pub record: ApiKey,
    pub plaintext: String,
}

/// `GET /api/auth/api-keys`: the caller's keys, newest first.
pub async fn list(
    State(state): State<AppState>,
    SessionAuth(ctx): SessionAuth,
) -> AppResult<Json<Vec<ApiKey>>> {
    let keys = state.auth.list_api_keys(ctx.user_id()).await?;
    Ok(Json(keys))
}

/// `POST /api/auth/api-keys`: issue a key.
pub async fn create(
    State(state): State<AppState>,
    SessionAuth(ctx): SessionAuth,
    Json(body): Json<CreateApiKeyRequest>,
) -> AppResult<(StatusCode, Json<CreateApiKeyResponse>)> {
    let (record, plaintext) = state.auth.create_api_key(ctx.user_id(), &body.name).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse { record, plaintext }),
    ))
}

/// `DELETE /api/auth/api-keys/{id}`: delete one of the caller's keys.
pub async fn delete(
    State(state): State<AppState>,
    SessionAuth(ctx): SessionAuth,
    Path(key_id): Path<i64>,
) -> AppResult<StatusCode> {
    state.auth.delete_api_key(ctx.user_id(), key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
