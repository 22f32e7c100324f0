use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::lifecycle::LifetimePolicy;
use crate::models::instance::{NewInstance, Secret};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterInstanceRequest {
    pub name: String,
    pub endpoint: String,
    pub database: String,
    pub username: String,
    pub secret: String,
    /// Token lifetime: "once", "forever", or e.g. "30d". Defaults to forever.
    pub policy: Option<LifetimePolicy>,
}

#[derive(Serialize)]
pub struct TokenIssuedResponse {
    pub name: String,
    pub policy: LifetimePolicy,
    pub token: String,
    pub message: String,
}

#[derive(Deserialize)]
pub struct RenewRequest {
    pub policy: LifetimePolicy,
}

#[derive(Serialize)]
pub struct RevokeResponse {
    pub revoked: bool,
    pub record_cleared: bool,
    pub cache_invalidated: bool,
}

/// Listing never includes the secret; `has_token` stands in for the token
/// value itself.
#[derive(Serialize)]
pub struct InstanceSummary {
    pub id: Uuid,
    pub name: String,
    pub endpoint: String,
    pub database: String,
    pub username: String,
    pub policy: LifetimePolicy,
    pub has_token: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ── Handlers ─────────────────────────────────────────────────

/// GET /api/v1/instances — list registered instances (secrets omitted)
pub async fn list_instances(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<InstanceSummary>>, AppError> {
    let records = state.store.list().await?;
    Ok(Json(
        records
            .into_iter()
            .map(|r| InstanceSummary {
                id: r.id,
                name: r.name,
                endpoint: r.endpoint,
                database: r.database,
                username: r.username,
                policy: r.policy,
                has_token: r.token.is_some(),
                expires_at: r.expires_at,
                created_at: r.created_at,
            })
            .collect(),
    ))
}

/// POST /api/v1/instances — register an instance and issue its first token
pub async fn register_instance(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterInstanceRequest>,
) -> Result<(StatusCode, Json<TokenIssuedResponse>), AppError> {
    let url = url::Url::parse(&payload.endpoint)
        .map_err(|_| AppError::BadRequest(format!("invalid endpoint URL: {}", payload.endpoint)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AppError::BadRequest(
            "endpoint must be an http(s) URL".to_string(),
        ));
    }

    let policy = payload.policy.unwrap_or(LifetimePolicy::Forever);
    let name = payload.name.clone();

    let token = state
        .broker
        .register(
            NewInstance {
                name: payload.name,
                endpoint: payload.endpoint,
                database: payload.database,
                username: payload.username,
                secret: Secret::new(payload.secret),
            },
            policy,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(TokenIssuedResponse {
            name,
            policy,
            message: format!("Use: Authorization: Bearer {}", token),
            token,
        }),
    ))
}

/// POST /api/v1/instances/:name/renew — issue a replacement token
pub async fn renew_instance(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<RenewRequest>,
) -> Result<Json<TokenIssuedResponse>, AppError> {
    let token = state.broker.renew(&name, payload.policy).await?;
    Ok(Json(TokenIssuedResponse {
        name,
        policy: payload.policy,
        message: format!("Use: Authorization: Bearer {}", token),
        token,
    }))
}

/// DELETE /api/v1/tokens/:token — revoke a token
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<RevokeResponse>, AppError> {
    let outcome = state.broker.revoke(&token).await?;
    Ok(Json(RevokeResponse {
        revoked: true,
        record_cleared: outcome.record_cleared,
        cache_invalidated: outcome.cache_invalidated,
    }))
}
