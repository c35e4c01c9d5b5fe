//! NEAR JSON-RPC implementation of [`Authority`].
//!
//! Permission bits come from the registry contract's `get_permission` view
//! method; access keys come from the `view_access_key_list` query.  Both are
//! read against `final` finality so that results are consistent across nodes.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::{Authority, AuthorityError};
use crate::auth::signature::PublicKey;
use crate::config::AuthorityConfig;

const PERMISSION_METHOD: &str = "get_permission";

// ---------------------------------------------------------------------------
// Client struct
// ---------------------------------------------------------------------------

pub struct NearRpcAuthority {
    http_client: reqwest::Client,
    rpc_url: String,
    contract_id: String,
}

impl NearRpcAuthority {
    pub fn new(config: &AuthorityConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("ledgergit/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build authority HTTP client")?;
        Ok(Self {
            http_client,
            rpc_url: config.rpc_url.clone(),
            contract_id: config.contract_id.clone(),
        })
    }

    /// Issue a `query` RPC and return its `result` object.
    async fn query(&self, params: Value) -> Result<Value, AuthorityError> {
        self.call("query", params).await
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, AuthorityError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": "ledgergit",
            "method": method,
            "params": params,
        });

        let resp = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(AuthorityError::Transport(format!(
                "RPC node returned {}",
                resp.status()
            )));
        }

        let body: RpcResponse = resp.json().await.map_err(transport_error)?;
        body.into_result()
    }
}

fn transport_error(err: reqwest::Error) -> AuthorityError {
    if err.is_timeout() {
        AuthorityError::Timeout
    } else if err.is_decode() {
        AuthorityError::Decode(err.to_string())
    } else {
        AuthorityError::Transport(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    name: String,
    #[serde(default)]
    cause: Option<RpcErrorCause>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcErrorCause {
    name: String,
}

impl RpcError {
    fn cause_name(&self) -> &str {
        self.cause.as_ref().map(|c| c.name.as_str()).unwrap_or("")
    }
}

impl RpcResponse {
    fn into_result(self) -> Result<Value, AuthorityError> {
        match (self.result, self.error) {
            (_, Some(err)) if err.cause_name() == "UNKNOWN_ACCOUNT" => {
                Ok(json!({ "unknown_account": true }))
            }
            (_, Some(err)) => Err(AuthorityError::Rpc(format!(
                "{} {} {}",
                err.name,
                err.cause_name(),
                err.message
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Err(AuthorityError::Decode("empty RPC response".into())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallFunctionResult {
    #[serde(default)]
    result: Vec<u8>,
    /// Older nodes report contract panics inside a successful envelope.
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessKeyList {
    keys: Vec<AccessKeyView>,
}

#[derive(Debug, Deserialize)]
struct AccessKeyView {
    public_key: String,
}

/// Decode the JSON return value of `get_permission` from a `call_function` result.
fn parse_permission_result(result: Value) -> Result<u32, AuthorityError> {
    if result.get("unknown_account").is_some() {
        return Err(AuthorityError::Rpc("registry contract account does not exist".into()));
    }
    let call: CallFunctionResult =
        serde_json::from_value(result).map_err(|e| AuthorityError::Decode(e.to_string()))?;
    if let Some(err) = call.error {
        return Err(AuthorityError::Rpc(err));
    }
    serde_json::from_slice::<u32>(&call.result)
        .map_err(|e| AuthorityError::Decode(format!("get_permission returned non-integer: {e}")))
}

/// Decode a `view_access_key_list` result, skipping keys of unsupported curves.
fn parse_access_keys(result: Value) -> Result<Vec<PublicKey>, AuthorityError> {
    if result.get("unknown_account").is_some() {
        return Ok(Vec::new());
    }
    let list: AccessKeyList =
        serde_json::from_value(result).map_err(|e| AuthorityError::Decode(e.to_string()))?;
    Ok(list
        .keys
        .into_iter()
        .filter_map(|k| match k.public_key.parse::<PublicKey>() {
            Ok(key) => Some(key),
            Err(e) => {
                debug!(public_key = %k.public_key, error = %e, "skipping access key");
                None
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Authority for NearRpcAuthority {
    #[instrument(skip(self), fields(contract = %self.contract_id))]
    async fn get_permission(&self, account_id: &str, path: &str) -> Result<u32, AuthorityError> {
        let args = json!({ "account_id": account_id, "path": path }).to_string();
        let result = self
            .query(json!({
                "request_type": "call_function",
                "finality": "final",
                "account_id": self.contract_id,
                "method_name": PERMISSION_METHOD,
                "args_base64": STANDARD.encode(args),
            }))
            .await?;
        let permission = parse_permission_result(result);
        if let Err(ref e) = permission {
            warn!(error = %e, "permission query failed");
        }
        permission
    }

    #[instrument(skip(self))]
    async fn get_access_keys(&self, account_id: &str) -> Result<Vec<PublicKey>, AuthorityError> {
        let result = self
            .query(json!({
                "request_type": "view_access_key_list",
                "finality": "final",
                "account_id": account_id,
            }))
            .await?;
        let keys = parse_access_keys(result)?;
        debug!(count = keys.len(), "fetched access keys");
        Ok(keys)
    }

    fn service_account(&self) -> &str {
        &self.contract_id
    }

    async fn ping(&self) -> Result<(), AuthorityError> {
        self.call("status", json!([])).await.map(|_| ())
    }
}
