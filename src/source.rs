use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Direction, TransferPage};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("RPC error: HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed RPC response: {0}")]
    Malformed(String),

    #[error("No page key known for {direction} page {page}")]
    UnknownPage { direction: Direction, page: u32 },
}

/// Paginated access to the transfers touching an address.
///
/// Page indexes start at 0 and must be requested in order per
/// (address, direction); `has_more` is false on the last page.
#[async_trait]
pub trait TransferSource: Send + Sync + 'static {
    async fn fetch_transfers(
        &self,
        address: &str,
        direction: Direction,
        page: u32,
        page_size: usize,
    ) -> Result<TransferPage, FetchError>;

    /// Drops any per-address paging state once no aggregator reads it.
    fn forget(&self, _address: &str) {}
}
