// Metashrew JSON-RPC client

//! Reads alkanes balances through the Metashrew indexer.
//! Calls go through a concurrency limit and are retried on transient failures.

use async_trait::async_trait;
use bitcoin::Address;
use log::debug;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use super::{is_transient, AssetQuery, RpcConfig};
use crate::error::{Result, SnowballError};
use crate::protostone::ALKANES_PROTOCOL_TAG;
use crate::types::ContractId;

/// Metashrew RPC request
#[derive(Serialize, Debug)]
struct MetashrewRpcRequest {
    /// JSON-RPC version
    jsonrpc: String,
    /// Method name
    method: String,
    /// Method parameters
    params: Value,
    /// Request ID
    id: u64,
}

/// Metashrew RPC response
#[derive(Deserialize, Debug)]
struct MetashrewRpcResponse {
    /// Result value
    result: Option<Value>,
    /// Error value
    error: Option<MetashrewRpcError>,
}

/// Metashrew RPC error
#[derive(Deserialize, Debug)]
struct MetashrewRpcError {
    /// Error code
    code: i32,
    /// Error message
    message: String,
}

/// Metashrew RPC client
pub struct MetashrewClient {
    /// HTTP client
    client: Client,
    url: String,
    max_retries: u32,
    retry_delay: Duration,
    /// Request ID counter
    request_id: AtomicU64,
    /// Rate limiter
    rate_limiter: Arc<Semaphore>,
}

impl MetashrewClient {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SnowballError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.metashrew_url.clone(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            request_id: AtomicU64::new(0),
            rate_limiter: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
        })
    }

    /// Call a Metashrew RPC method with retry logic
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| SnowballError::Network(format!("rate limiter closed: {}", e)))?;

        let mut attempt = 0;
        loop {
            match self.execute_call(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) if attempt < self.max_retries && is_transient(&err) => {
                    attempt += 1;
                    debug!(
                        "Retrying Metashrew RPC call to {} (attempt {}/{})",
                        method, attempt, self.max_retries
                    );
                    sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Execute a single RPC call without retry logic
    async fn execute_call(&self, method: &str, params: Value) -> Result<Value> {
        debug!("Calling Metashrew RPC method: {}", method);

        let request = MetashrewRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: self.request_id.fetch_add(1, Ordering::SeqCst),
        };

        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SnowballError::Network(format!(
                "Metashrew RPC request failed with status: {}",
                status
            )));
        }

        let body = response.json::<MetashrewRpcResponse>().await?;
        match (body.result, body.error) {
            (Some(result), _) => Ok(result),
            (None, Some(error)) => Err(SnowballError::AssetBalance(format!(
                "Metashrew RPC error: {} (code: {})",
                error.message, error.code
            ))),
            (None, None) => Err(SnowballError::AssetBalance("Metashrew RPC returned no result".to_string())),
        }
    }

    /// Current indexed height
    pub async fn height(&self) -> Result<u64> {
        let result = self.call("metashrew_height", json!([])).await?;
        parse_u64(&result).ok_or_else(|| SnowballError::AssetBalance(format!("invalid height {}", result)))
    }
}

fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => parse_hex_or_decimal(s).and_then(|v| u64::try_from(v).ok()),
        _ => None,
    }
}

/// Indexer numbers come as `0x` hex strings, plain decimal strings or JSON numbers
fn parse_hex_or_decimal(raw: &str) -> Option<u128> {
    match raw.strip_prefix("0x") {
        Some(hex) => u128::from_str_radix(hex, 16).ok(),
        None => raw.parse::<u128>().ok(),
    }
}

fn parse_u128(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => parse_hex_or_decimal(s),
        _ => None,
    }
}

/// Sum the balance of `contract_id` across every outpoint of a
/// `protorunesbyaddress` response
pub(crate) fn sum_contract_balance(result: &Value, contract_id: ContractId) -> Result<u128> {
    let outpoints = result
        .get("outpoints")
        .and_then(Value::as_array)
        .ok_or_else(|| SnowballError::AssetBalance("invalid response: missing outpoints".to_string()))?;

    let mut total: u128 = 0;
    for outpoint in outpoints {
        let Some(runes) = outpoint.get("runes").and_then(Value::as_array) else {
            continue;
        };
        for rune in runes {
            let id = rune.get("rune").and_then(|r| r.get("id"));
            let block = id.and_then(|i| i.get("block")).and_then(parse_u128);
            let tx = id.and_then(|i| i.get("tx")).and_then(parse_u128);
            if block != Some(contract_id.block as u128) || tx != Some(contract_id.tx as u128) {
                continue;
            }
            let balance = rune
                .get("balance")
                .and_then(parse_u128)
                .ok_or_else(|| SnowballError::AssetBalance("invalid rune: missing balance".to_string()))?;
            total = total.saturating_add(balance);
        }
    }
    Ok(total)
}

#[async_trait]
impl AssetQuery for MetashrewClient {
    async fn balance_of(&self, address: &Address, contract_id: ContractId) -> Result<u128> {
        debug!("Getting {} balance for address: {}", contract_id, address);
        let result = self
            .call(
                "alkanes_protorunesbyaddress",
                json!([{
                    "address": address.to_string(),
                    "protocolTag": ALKANES_PROTOCOL_TAG.to_string(),
                }]),
            )
            .await?;
        let balance = sum_contract_balance(&result, contract_id)?;
        debug!("Balance of {} at {}: {}", contract_id, address, balance);
        Ok(balance)
    }
}
