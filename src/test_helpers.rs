use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::models::{
    Direction, Quantity, Transfer, TransferCategory, TransferMetadata, TransferPage, TransferValue,
};
use crate::source::{FetchError, TransferSource};

pub fn transfer(hash: &str, block: u64, category: TransferCategory, asset: &str, value: &str) -> Transfer {
    Transfer {
        hash: hash.to_string(),
        block_num: format!("0x{:x}", block),
        category,
        unique_id: None,
        from: None,
        to: None,
        asset: Some(asset.to_string()),
        value: Some(TransferValue::Text(value.to_string())),
        token_id: None,
        raw_contract: None,
        transaction_index: None,
        metadata: None,
    }
}

pub fn native(hash: &str, block: u64, value: &str) -> Transfer {
    transfer(hash, block, TransferCategory::External, "ETH", value)
}

pub fn token(hash: &str, block: u64, value: &str) -> Transfer {
    transfer(hash, block, TransferCategory::Erc20, "USDC", value)
}

pub fn transfer_at(hash: &str, block: u64, timestamp: Option<&str>, index: Option<u64>) -> Transfer {
    let mut t = native(hash, block, "1");
    t.metadata = timestamp.map(|ts| TransferMetadata {
        block_timestamp: Some(ts.to_string()),
    });
    t.transaction_index = index.map(Quantity::Number);
    t
}

/// In-memory `TransferSource` that pages through fixed per-direction lists.
///
/// Lists are served in the given order. A direction can be made to fail, and
/// `gated()` holds every fetch until the test hands out permits.
#[derive(Default)]
pub struct MemorySource {
    outgoing: Vec<Transfer>,
    incoming: Vec<Transfer>,
    failing: Mutex<HashSet<Direction>>,
    gate: Option<Arc<Semaphore>>,
    entered: AtomicUsize,
    calls: Mutex<Vec<(Direction, u32, usize)>>,
    forgotten: Mutex<Vec<String>>,
}

impl MemorySource {
    pub fn new(outgoing: Vec<Transfer>, incoming: Vec<Transfer>) -> Self {
        Self {
            outgoing,
            incoming,
            ..Default::default()
        }
    }

    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn fail(&self, direction: Direction) {
        self.failing.lock().unwrap().insert(direction);
    }

    /// Fetches that have started, including ones still held at the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(Direction, u32, usize)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, direction: Direction) -> usize {
        self.calls().iter().filter(|(d, _, _)| *d == direction).count()
    }

    /// Addresses passed to `forget`, in order.
    pub fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferSource for MemorySource {
    async fn fetch_transfers(
        &self,
        _address: &str,
        direction: Direction,
        page: u32,
        page_size: usize,
    ) -> Result<TransferPage, FetchError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.calls.lock().unwrap().push((direction, page, page_size));

        if self.failing.lock().unwrap().contains(&direction) {
            return Err(FetchError::Malformed(format!("{} source unavailable", direction.as_param())));
        }

        let all = match direction {
            Direction::Out => &self.outgoing,
            Direction::In => &self.incoming,
        };
        let start = (page as usize * page_size).min(all.len());
        let end = (start + page_size).min(all.len());
        Ok(TransferPage {
            transfers: all[start..end].to_vec(),
            has_more: end < all.len(),
        })
    }

    fn forget(&self, address: &str) {
        self.forgotten.lock().unwrap().push(address.to_string());
    }
}
