// src/rpc.rs
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::{Direction, Transfer, TransferPage};
use crate::source::{FetchError, TransferSource};

/// Largest `maxCount` alchemy_getAssetTransfers accepts
pub const MAX_TRANSFERS_PER_REQUEST: usize = 1000;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetTransfers {
    #[serde(default)]
    transfers: Vec<Transfer>,
    #[serde(default)]
    page_key: Option<String>,
}

/// `TransferSource` backed by Alchemy's `alchemy_getAssetTransfers`.
///
/// Alchemy paginates with opaque `pageKey` tokens, so the client remembers
/// the token each page handed back and resolves page index `n` to the token
/// returned by page `n - 1`.
pub struct AlchemyClient {
    client: Client,
    rpc_url: String,
    categories: Vec<String>,
    max_attempts: u32,
    retry_pause: Duration,
    page_keys: Mutex<HashMap<(String, Direction), Vec<String>>>,
}

impl AlchemyClient {
    pub fn new(
        rpc_url: impl Into<String>,
        categories: Vec<String>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            rpc_url: rpc_url.into(),
            categories,
            max_attempts: max_attempts.max(1),
            retry_pause: Duration::from_secs(2),
            page_keys: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    fn page_key(&self, address: &str, direction: Direction, page: u32) -> Result<Option<String>, FetchError> {
        if page == 0 {
            return Ok(None);
        }
        let keys = self.page_keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.get(&(address.to_string(), direction))
            .and_then(|k| k.get(page as usize - 1))
            .cloned()
            .map(Some)
            .ok_or(FetchError::UnknownPage { direction, page })
    }

    fn remember_page_key(&self, address: &str, direction: Direction, page: u32, next: Option<&str>) {
        let mut keys = self.page_keys.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = keys.entry((address.to_string(), direction)).or_default();
        let idx = page as usize;
        entry.truncate(idx);
        if let Some(next) = next {
            if entry.len() == idx {
                entry.push(next.to_string());
            }
        }
    }

    fn request_body(&self, address: &str, direction: Direction, page_size: usize, page_key: Option<&str>) -> Value {
        let mut params = json!({
            "fromBlock": "0x0",
            "toBlock": "latest",
            "category": self.categories,
            "withMetadata": true,
            "excludeZeroValue": false,
            "order": "desc",
            "maxCount": format!("0x{:x}", page_size.clamp(1, MAX_TRANSFERS_PER_REQUEST)),
        });
        match direction {
            Direction::Out => params["fromAddress"] = json!(address),
            Direction::In => params["toAddress"] = json!(address),
        }
        if let Some(key) = page_key {
            params["pageKey"] = json!(key);
        }

        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "alchemy_getAssetTransfers",
            "params": [params]
        })
    }

    /// POST with retries on transport failure; HTTP status errors are returned as-is.
    async fn post(&self, payload: &Value) -> Result<String, FetchError> {
        let mut attempt = 1;
        loop {
            match self.client.post(&self.rpc_url).json(payload).send().await {
                Ok(resp) => {
                    if resp.status() != StatusCode::OK {
                        return Err(FetchError::Status(resp.status()));
                    }
                    return Ok(resp.text().await?);
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        "⚠️ RPC request failed (attempt {}/{}): {}. Retrying...",
                        attempt, self.max_attempts, e
                    );
                    tokio::time::sleep(self.retry_pause).await;
                    attempt += 1;
                }
                Err(e) => return Err(FetchError::Transport(e)),
            }
        }
    }
}

#[async_trait]
impl TransferSource for AlchemyClient {
    async fn fetch_transfers(
        &self,
        address: &str,
        direction: Direction,
        page: u32,
        page_size: usize,
    ) -> Result<TransferPage, FetchError> {
        let page_key = self.page_key(address, direction, page)?;
        let payload = self.request_body(address, direction, page_size, page_key.as_deref());

        info!(
            "📡 Sending alchemy_getAssetTransfers ({} page {}, max {}) for {}",
            direction.as_param(),
            page,
            page_size,
            address
        );

        let text = self.post(&payload).await?;
        let parsed: RpcResponse<AssetTransfers> =
            serde_json::from_str(&text).map_err(|e| FetchError::Malformed(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(FetchError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let result = parsed
            .result
            .ok_or_else(|| FetchError::Malformed("response has neither result nor error".into()))?;

        self.remember_page_key(address, direction, page, result.page_key.as_deref());
        debug!(
            "📩 {} page {} → {} transfers (more: {})",
            direction.as_param(),
            page,
            result.transfers.len(),
            result.page_key.is_some()
        );

        Ok(TransferPage {
            has_more: result.page_key.is_some(),
            transfers: result.transfers,
        })
    }

    fn forget(&self, address: &str) {
        let mut keys = self.page_keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.retain(|(a, _), _| a != address);
    }
}
