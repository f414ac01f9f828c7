// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of the tracked address a transfer was fetched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

impl Direction {
    /// Name used by the fetch capability ("incoming" / "outgoing").
    pub fn as_param(&self) -> &'static str {
        match self {
            Direction::In => "incoming",
            Direction::Out => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("IN"),
            Direction::Out => f.write_str("OUT"),
        }
    }
}

/// Transfer kind as reported by the indexer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransferCategory {
    External,
    Internal,
    Erc20,
    Erc721,
    Erc1155,
    SpecialNft,
    Other(String),
}

impl TransferCategory {
    /// `external` and `internal` move the chain's native asset; everything else is a token.
    pub fn is_native(&self) -> bool {
        matches!(self, TransferCategory::External | TransferCategory::Internal)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TransferCategory::External => "external",
            TransferCategory::Internal => "internal",
            TransferCategory::Erc20 => "erc20",
            TransferCategory::Erc721 => "erc721",
            TransferCategory::Erc1155 => "erc1155",
            TransferCategory::SpecialNft => "specialnft",
            TransferCategory::Other(s) => s,
        }
    }
}

impl From<String> for TransferCategory {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "external" => TransferCategory::External,
            "internal" => TransferCategory::Internal,
            "erc20" => TransferCategory::Erc20,
            "erc721" => TransferCategory::Erc721,
            "erc1155" => TransferCategory::Erc1155,
            "specialnft" => TransferCategory::SpecialNft,
            _ => TransferCategory::Other(s),
        }
    }
}

impl From<TransferCategory> for String {
    fn from(c: TransferCategory) -> Self {
        c.as_str().to_string()
    }
}

/// Transfer amount; the indexer sends a JSON number, other sources send strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransferValue {
    Number(serde_json::Number),
    Text(String),
}

impl TransferValue {
    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            TransferValue::Number(n) => Decimal::from_str(&n.to_string())
                .ok()
                .or_else(|| n.as_f64().and_then(Decimal::from_f64)),
            TransferValue::Text(s) => {
                let s = s.trim();
                if let Some(hex) = s.strip_prefix("0x") {
                    return u128::from_str_radix(hex, 16).ok().and_then(Decimal::from_u128);
                }
                Decimal::from_str(s)
                    .or_else(|_| Decimal::from_scientific(s))
                    .ok()
            }
        }
    }
}

/// Block number or transaction index, hex string or plain number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(u64),
    Text(String),
}

impl Quantity {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Quantity::Number(n) => Some(*n),
            Quantity::Text(s) => parse_quantity(s),
        }
    }
}

/// Parses `"0x1a2b"` style hex, falling back to decimal.
pub fn parse_quantity(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawContract {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal: Option<String>,
}

/// A single asset movement as reported by the upstream indexer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub hash: String,
    pub block_num: String,
    pub category: TransferCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<TransferValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_contract: Option<RawContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_index: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TransferMetadata>,
}

impl Transfer {
    /// Decoded block number; an undecodable value sorts as block 0.
    pub fn block_number(&self) -> u64 {
        parse_quantity(&self.block_num).unwrap_or(0)
    }

    pub fn block_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.metadata.as_ref()?.block_timestamp.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    pub fn transaction_index(&self) -> Option<u64> {
        self.transaction_index.as_ref().and_then(Quantity::as_u64)
    }

    /// True when no economic value moved: missing value or a value that decodes to zero.
    /// A value that cannot be decoded counts as non-zero.
    pub fn is_zero_value(&self) -> bool {
        match &self.value {
            None => true,
            Some(v) => v.to_decimal().map(|d| d.is_zero()).unwrap_or(false),
        }
    }

    pub fn tagged(self, direction: Direction) -> TaggedTransfer {
        TaggedTransfer {
            transfer: self,
            direction,
        }
    }
}

/// A transfer plus the direction it was fetched for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedTransfer {
    #[serde(flatten)]
    pub transfer: Transfer,
    pub direction: Direction,
}

impl TaggedTransfer {
    pub fn hash(&self) -> &str {
        &self.transfer.hash
    }
}

/// One page returned by a `TransferSource`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferPage {
    pub transfers: Vec<Transfer>,
    pub has_more: bool,
}
