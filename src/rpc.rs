//! JSON-RPC client for executing operations against a resolved ERP
//! instance. The broker never inspects or caches anything at this layer;
//! credentials come in per call and results pass through untouched.

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::errors::AppError;
use crate::models::instance::Credentials;

/// The record-level operations the gateway forwards upstream.
#[derive(Debug, Clone)]
pub enum RpcOperation {
    SearchRead {
        model: String,
        domain: Value,
        fields: Value,
    },
    Create {
        model: String,
        values: Value,
    },
    Update {
        model: String,
        id: i64,
        values: Value,
    },
    Delete {
        model: String,
        id: i64,
    },
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    message: String,
    data: Option<Value>,
}

impl JsonRpcError {
    /// Only the upstream's message fields are surfaced; request arguments
    /// (which carry credentials) are never echoed.
    fn describe(&self) -> String {
        match self
            .data
            .as_ref()
            .and_then(|d| d.get("message"))
            .and_then(Value::as_str)
        {
            Some(detail) => format!("{}: {}", self.message, detail),
            None => self.message.clone(),
        }
    }
}

pub struct ErpClient {
    client: ClientWithMiddleware,
}

impl Default for ErpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ErpClient {
    pub fn new() -> Self {
        let reqwest_client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .timeout(Duration::from_secs(60)) // Total timeout including retries
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = ClientBuilder::new(reqwest_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self { client }
    }

    /// Execute one operation against the instance the credentials resolve
    /// to: authenticate for the session uid, then dispatch via execute_kw.
    pub async fn execute(
        &self,
        creds: &Credentials,
        op: RpcOperation,
    ) -> Result<Value, AppError> {
        let uid = self.authenticate(creds).await?;

        let (model, method, args, kwargs) = match op {
            RpcOperation::SearchRead {
                model,
                domain,
                fields,
            } => (
                model,
                "search_read",
                json!([domain]),
                json!({ "fields": fields }),
            ),
            RpcOperation::Create { model, values } => {
                (model, "create", json!([values]), json!({}))
            }
            RpcOperation::Update { model, id, values } => {
                (model, "write", json!([[id], values]), json!({}))
            }
            RpcOperation::Delete { model, id } => (model, "unlink", json!([[id]]), json!({})),
        };

        self.call(
            creds,
            "object",
            "execute_kw",
            json!([
                creds.database,
                uid,
                creds.secret.expose(),
                model,
                method,
                args,
                kwargs
            ]),
        )
        .await
    }

    async fn authenticate(&self, creds: &Credentials) -> Result<i64, AppError> {
        let result = self
            .call(
                creds,
                "common",
                "authenticate",
                json!([creds.database, creds.username, creds.secret.expose(), {}]),
            )
            .await?;

        // Upstream returns false (not an error) on bad credentials.
        result
            .as_i64()
            .filter(|uid| *uid > 0)
            .ok_or_else(|| AppError::Upstream("upstream authentication failed".to_string()))
    }

    async fn call(
        &self,
        creds: &Credentials,
        service: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, AppError> {
        let url = format!("{}/jsonrpc", creds.endpoint.trim_end_matches('/'));
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": { "service": service, "method": method, "args": args },
            "id": 1,
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("upstream request failed after retries: {}", e);
                AppError::Upstream(e.to_string())
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "upstream returned HTTP {}",
                status
            )));
        }

        let body: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("malformed upstream response: {}", e)))?;

        if let Some(err) = body.error {
            return Err(AppError::Upstream(err.describe()));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}
