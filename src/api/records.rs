//! Data-plane endpoints: resolve the bearer token through the broker, then
//! forward the record operation to the instance's upstream RPC endpoint.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::rpc::RpcOperation;
use crate::AppState;

fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(AppError::MissingToken)
}

fn parse_json_param(name: &str, raw: &str) -> Result<Value, AppError> {
    serde_json::from_str(raw)
        .map_err(|_| AppError::BadRequest(format!("parameter '{}' is not valid JSON", name)))
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub model: String,
    /// JSON list of search conditions, defaults to [].
    pub domain: Option<String>,
    /// JSON list of fields to return, defaults to [].
    pub fields: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateBody {
    pub model: String,
    pub values: Value,
}

#[derive(Deserialize)]
pub struct UpdateBody {
    pub model: String,
    pub id: i64,
    pub values: Value,
}

#[derive(Deserialize)]
pub struct DeleteBody {
    pub model: String,
    pub id: i64,
}

/// GET /records — query records upstream via search_read
pub async fn get_records(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, AppError> {
    let token = extract_bearer_token(&headers)?;
    let domain = parse_json_param("domain", params.domain.as_deref().unwrap_or("[]"))?;
    let fields = parse_json_param("fields", params.fields.as_deref().unwrap_or("[]"))?;

    let creds = state.broker.resolve(&token).await?;
    let data = state
        .rpc
        .execute(
            &creds,
            RpcOperation::SearchRead {
                model: params.model,
                domain,
                fields,
            },
        )
        .await?;

    Ok(Json(json!({ "data": data })))
}

/// POST /records — create a record upstream
pub async fn create_record(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<Json<Value>, AppError> {
    let token = extract_bearer_token(&headers)?;
    let creds = state.broker.resolve(&token).await?;

    let record_id = state
        .rpc
        .execute(
            &creds,
            RpcOperation::Create {
                model: body.model,
                values: body.values,
            },
        )
        .await?;

    Ok(Json(json!({ "success": true, "record_id": record_id })))
}

/// PUT /records — update a record upstream
pub async fn update_record(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateBody>,
) -> Result<Json<Value>, AppError> {
    let token = extract_bearer_token(&headers)?;
    let creds = state.broker.resolve(&token).await?;

    let result = state
        .rpc
        .execute(
            &creds,
            RpcOperation::Update {
                model: body.model,
                id: body.id,
                values: body.values,
            },
        )
        .await?;

    Ok(Json(json!({ "success": result })))
}

/// DELETE /records — delete a record upstream
pub async fn delete_record(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DeleteBody>,
) -> Result<Json<Value>, AppError> {
    let token = extract_bearer_token(&headers)?;
    let creds = state.broker.resolve(&token).await?;

    let id = body.id;
    state
        .rpc
        .execute(
            &creds,
            RpcOperation::Delete {
                model: body.model,
                id,
            },
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("record {} deleted", id)
    })))
}
