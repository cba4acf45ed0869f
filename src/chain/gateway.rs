//! Contract Gateway
//!
//! REST client for a ledger front service: contract transactions and calls
//! go through `/trans/handle`, node status through `/{group}/web3/...`.
//! The BSN managed network additionally requires an app key header.

use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::ChainConfig;
use crate::upload::normalize_hash;

use super::error::ChainError;
use super::types::ChainType;

/// Header carrying the BSN application key
pub const BSN_APP_KEY_HEADER: &str = "x-bsn-app-key";

/// Result of a state-changing contract call
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome {
    pub transaction_hash: String,
    pub block_number: Option<u64>,
    /// Decoded return values
    pub values: Vec<Value>,
}

#[derive(Clone)]
pub struct ContractGateway {
    client: Client,
    chain: ChainType,
    base_url: String,
    group_id: u32,
    contract_name: String,
    contract_address: String,
    user_address: String,
    app_key: Option<String>,
}

impl ContractGateway {
    pub fn new(chain: ChainType, config: &ChainConfig) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChainError::io(chain, "connect", e.to_string()))?;

        Ok(Self {
            client,
            chain,
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            group_id: config.group_id,
            contract_name: config.contract_name.clone(),
            contract_address: config.contract_address.clone(),
            user_address: config.user_address.clone(),
            app_key: config.app_key.clone().filter(|key| !key.is_empty()),
        })
    }

    pub fn chain_type(&self) -> ChainType {
        self.chain
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a state-changing contract transaction
    pub async fn transact(
        &self,
        operation: &'static str,
        params: Vec<Value>,
    ) -> Result<TransactionOutcome, ChainError> {
        let url = format!("{}/trans/handle", self.base_url);
        let request = self.client.post(url).json(&self.handle_body(operation, params));
        let body = self.send_json(operation, request).await?;
        parse_transaction(self.chain, operation, &body)
    }

    /// Read-only contract call returning decoded values
    pub async fn call(&self, operation: &'static str, params: Vec<Value>) -> Result<Vec<Value>, ChainError> {
        let url = format!("{}/trans/handle", self.base_url);
        let request = self.client.post(url).json(&self.handle_body(operation, params));

        match self.send_json(operation, request).await? {
            Value::Array(values) => Ok(values),
            Value::Null => Ok(Vec::new()),
            other => Err(ChainError::io(
                self.chain,
                operation,
                format!("unexpected call response: {}", other),
            )),
        }
    }

    /// GET a node status endpoint under `/{group}/web3/`
    pub async fn web3(&self, operation: &'static str, path: &str) -> Result<Value, ChainError> {
        let url = format!("{}/{}/web3/{}", self.base_url, self.group_id, path);
        self.send_json(operation, self.client.get(url)).await
    }

    fn handle_body(&self, func_name: &str, params: Vec<Value>) -> Value {
        json!({
            "groupId": self.group_id.to_string(),
            "user": self.user_address,
            "contractName": self.contract_name,
            "contractAddress": self.contract_address,
            "funcName": func_name,
            "funcParam": params,
            "useCns": false,
        })
    }

    fn with_app_key(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.app_key {
            Some(key) => request.header(BSN_APP_KEY_HEADER, key),
            None => request,
        }
    }

    async fn send_json(&self, operation: &'static str, request: RequestBuilder) -> Result<Value, ChainError> {
        let response = self
            .with_app_key(request)
            .send()
            .await
            .map_err(|e| ChainError::from_reqwest(self.chain, operation, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                chain = %self.chain,
                operation = operation,
                status = status.as_u16(),
                "Ledger gateway returned an error status"
            );
            return Err(ChainError::io(
                self.chain,
                operation,
                format!("gateway returned {}: {}", status, body),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ChainError::from_reqwest(self.chain, operation, &e))?;

        check_gateway_error(self.chain, operation, &body)?;
        Ok(body)
    }
}

// ============================================================================
// Response Parsing
// ============================================================================

/// Gateways report business failures as `{"code": <non-zero>, "errorMessage": ...}`
pub(crate) fn check_gateway_error(
    chain: ChainType,
    operation: &'static str,
    body: &Value,
) -> Result<(), ChainError> {
    let Some(code) = body.get("code").and_then(value_u64) else {
        return Ok(());
    };
    if code == 0 {
        return Ok(());
    }

    let message = body
        .get("errorMessage")
        .or_else(|| body.get("message"))
        .and_then(value_str)
        .unwrap_or_else(|| format!("gateway error code {}", code));
    Err(ChainError::rejected(chain, operation, message))
}

pub(crate) fn parse_transaction(
    chain: ChainType,
    operation: &'static str,
    body: &Value,
) -> Result<TransactionOutcome, ChainError> {
    let transaction_hash = body
        .get("transactionHash")
        .and_then(value_str)
        .map(|hash| normalize_hash(&hash))
        .filter(|hash| !hash.is_empty())
        .ok_or_else(|| ChainError::io(chain, operation, "transaction receipt is missing its hash"))?;

    let succeeded = match body.get("status") {
        None | Some(Value::Null) => true,
        Some(status) => value_u64(status) == Some(0),
    };
    if !succeeded {
        let message = body
            .get("message")
            .or_else(|| body.get("statusMsg"))
            .and_then(value_str)
            .unwrap_or_else(|| format!("transaction status {}", body["status"]));
        return Err(ChainError::rejected(chain, operation, message));
    }

    let values = body
        .get("returnObject")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Ok(TransactionOutcome {
        transaction_hash,
        block_number: body.get("blockNumber").and_then(value_u64),
        values,
    })
}

pub(crate) fn value_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Numbers, decimal strings and `0x` hex strings
pub(crate) fn value_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some("") => Some(0),
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

pub(crate) fn value_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().map(|n| n != 0),
        _ => None,
    }
}

/// A hash given as a hex string or as a byte array
pub(crate) fn value_hash(value: &Value) -> Option<String> {
    let hash = match value {
        Value::String(s) => normalize_hash(s),
        Value::Array(bytes) => {
            let bytes: Option<Vec<u8>> = bytes
                .iter()
                .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            hex::encode(bytes?)
        }
        _ => return None,
    };
    (!hash.is_empty()).then_some(hash)
}
