use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use url::Url;

/// Attempts used when dialing an RPC endpoint before giving up.
pub const DEFAULT_RETRY_ATTEMPTS: usize = 10;

/// Total time budget for a transaction-receipt wait.
pub const RECEIPT_WAIT_DEADLINE: Duration = Duration::from_secs(600);

const BACKOFF_START: Duration = Duration::from_millis(1);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc transport failure: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Server { code: i64, message: String },
    #[error("unexpected rpc response: {0}")]
    Protocol(String),
    #[error("timed out waiting for transaction receipt")]
    ReceiptTimeout,
    #[error("no endpoint answered after {0} attempts")]
    DialExhausted(usize),
}

/// Hashes of one block as reported over RPC; `None` from the lookup means the
/// node does not have the block yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct BlockSummary {
    pub hash: B256,
    #[serde(rename = "stateRoot")]
    pub state_root: B256,
    #[serde(rename = "receiptsRoot")]
    pub receipts_root: B256,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TransactionReceipt {
    pub status: String,
    #[serde(rename = "blockNumber", default)]
    pub block_number: Option<String>,
}

impl TransactionReceipt {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == "0x1"
    }
}

/// A transaction ready for submission: the signed raw payload plus the
/// identity needed for bookkeeping.
#[derive(Clone, Debug)]
pub struct SignedTransaction {
    pub hash: B256,
    pub sender: Address,
    pub nonce: u64,
    pub raw: Vec<u8>,
}

/// `0x`-prefixed lowercase hex block-number parameter.
#[must_use]
pub fn encode_block_number(number: u64) -> String {
    format!("0x{number:x}")
}

pub fn parse_hex_u64(value: &Value) -> Result<u64, RpcError> {
    let text = value
        .as_str()
        .ok_or_else(|| RpcError::Protocol(format!("expected hex string, got {value}")))?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|err| RpcError::Protocol(format!("bad hex quantity {text}: {err}")))
}

/// The Ethereum JSON-RPC subset the harness drives networks through. Typed
/// helpers are defined on top of the single `call` entry point so test
/// doubles only need to answer raw calls.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    async fn block_number(&self) -> Result<u64, RpcError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&result)
    }

    async fn block_summary(&self, number: u64) -> Result<Option<BlockSummary>, RpcError> {
        let result = self
            .call(
                "eth_getBlockByNumber",
                json!([encode_block_number(number), false]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|err| RpcError::Protocol(format!("bad block summary: {err}")))
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        let result = self.call("eth_chainId", json!([])).await?;
        parse_hex_u64(&result)
    }

    async fn nonce_at(&self, account: Address) -> Result<u64, RpcError> {
        let result = self
            .call(
                "eth_getTransactionCount",
                json!([format!("{account:?}"), "latest"]),
            )
            .await?;
        parse_hex_u64(&result)
    }

    async fn balance_at(&self, account: Address) -> Result<U256, RpcError> {
        let result = self
            .call("eth_getBalance", json!([format!("{account:?}"), "latest"]))
            .await?;
        let text = result
            .as_str()
            .ok_or_else(|| RpcError::Protocol(format!("expected hex balance, got {result}")))?;
        text.parse::<U256>()
            .map_err(|err| RpcError::Protocol(format!("bad balance {text}: {err}")))
    }

    async fn suggest_gas_price(&self) -> Result<u128, RpcError> {
        let result = self.call("eth_gasPrice", json!([])).await?;
        Ok(u128::from(parse_hex_u64(&result)?))
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, RpcError> {
        let payload = format!("0x{}", hex::encode(raw));
        let result = self.call("eth_sendRawTransaction", json!([payload])).await?;
        let text = result
            .as_str()
            .ok_or_else(|| RpcError::Protocol(format!("expected tx hash, got {result}")))?;
        text.parse::<B256>()
            .map_err(|err| RpcError::Protocol(format!("bad tx hash {text}: {err}")))
    }

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        let result = self
            .call("eth_getTransactionReceipt", json!([format!("{hash:?}")]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|err| RpcError::Protocol(format!("bad receipt: {err}")))
    }

    /// Polls for the receipt with exponential backoff until the deadline.
    async fn wait_transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<TransactionReceipt, RpcError> {
        let begin = Instant::now();
        let mut delay = BACKOFF_START;
        while begin.elapsed() < RECEIPT_WAIT_DEADLINE {
            if let Some(receipt) = self.transaction_receipt(hash).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(BACKOFF_CAP);
        }
        Err(RpcError::ReceiptTimeout)
    }

    /// The current structured rule document, as reported by the network.
    async fn get_rules(&self) -> Result<Value, RpcError> {
        self.call("eth_getRules", json!(["latest"])).await
    }
}

/// JSON-RPC over HTTP, the wire used for all real networks.
pub struct HttpRpcClient {
    url: Url,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))?
            .error_for_status()
            .map_err(|err| RpcError::Transport(err.to_string()))?;

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|err| RpcError::Protocol(err.to_string()))?;

        if let Some(error) = body.error {
            return Err(RpcError::Server {
                code: error.code,
                message: error.message,
            });
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

/// Runs the operation up to `attempts` times with capped exponential backoff
/// between tries.
pub async fn retry<T, E, F, Fut>(attempts: usize, mut op: F) -> Result<T, RpcError>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut delay = BACKOFF_START;
    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::debug!(attempt, %err, "rpc attempt failed");
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(BACKOFF_CAP);
    }
    Err(RpcError::DialExhausted(attempts))
}
