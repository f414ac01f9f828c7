use dotenvy::dotenv;
use eyre::{eyre, Result};
use std::{env, time::Duration};
use tracing::info;

use crate::aggregator::{AggregatorOptions, DEFAULT_BUFFER_SIZE, DEFAULT_PAGE_SIZE};
use crate::registry::DEFAULT_MAX_FEEDS;

pub const DEFAULT_URL_TEMPLATE: &str = "https://{network}.g.alchemy.com/v2/{key}";

#[derive(Clone)]
pub struct Config {
    pub alchemy_api_key: String,
    pub url_template: String,
    pub networks: Vec<String>,
    pub categories: Vec<String>,
    pub page_size: usize,
    pub buffer_size: usize,
    pub rpc_timeout: Duration,
    pub rpc_max_attempts: u32,
    pub max_feeds: usize,
    pub port: u16,
}

impl Config {
    pub fn rpc_url(&self, network: &str) -> String {
        self.url_template
            .replace("{network}", network)
            .replace("{key}", &self.alchemy_api_key)
    }

    pub fn aggregator_options(&self) -> AggregatorOptions {
        AggregatorOptions {
            page_size: self.page_size,
            buffer_size: self.buffer_size,
        }
    }
}

fn list(raw: Option<String>, default: &str) -> Vec<String> {
    let items: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        default.split(',').map(str::to_string).collect()
    } else {
        items
    }
}

fn number<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Builds the config from any key lookup; `load` passes the process environment.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let alchemy_api_key = lookup("ALCHEMY_API_KEY")
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| eyre!("ALCHEMY_API_KEY is not set"))?;

    let url_template = lookup("ALCHEMY_URL_TEMPLATE").unwrap_or_else(|| DEFAULT_URL_TEMPLATE.to_string());
    let networks = list(lookup("ALCHEMY_NETWORKS"), "eth-mainnet,eth-sepolia");
    let categories = list(lookup("TRANSFER_CATEGORIES"), "external,internal,erc20");

    // page size 0 would never make progress
    let page_size = number(lookup("PAGE_SIZE"), DEFAULT_PAGE_SIZE).max(1);
    let buffer_size = number(lookup("BUFFER_SIZE"), DEFAULT_BUFFER_SIZE);

    let rpc_timeout = Duration::from_secs(number(lookup("RPC_TIMEOUT_SECS"), 15));
    let rpc_max_attempts = number(lookup("RPC_MAX_ATTEMPTS"), 3);
    let max_feeds = number(lookup("MAX_FEEDS"), DEFAULT_MAX_FEEDS).max(1);
    let port = number(lookup("PORT"), 8080);

    Ok(Config {
        alchemy_api_key,
        url_template,
        networks,
        categories,
        page_size,
        buffer_size,
        rpc_timeout,
        rpc_max_attempts,
        max_feeds,
        port,
    })
}

pub fn load() -> Result<Config> {
    dotenv().ok();

    let cfg = from_lookup(|key| env::var(key).ok())?;

    // the API key stays out of the logs
    info!("Loaded config:");
    info!("  Networks: {:?}", cfg.networks);
    info!("  Categories: {:?}", cfg.categories);
    info!("  Page size: {} (buffer {})", cfg.page_size, cfg.buffer_size);
    info!("  RPC timeout: {:?}, attempts: {}", cfg.rpc_timeout, cfg.rpc_max_attempts);
    info!("  Max live feeds: {}", cfg.max_feeds);
    info!("  Port: {}", cfg.port);

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = from_lookup(lookup(&[("ALCHEMY_API_KEY", "k")])).unwrap();
        assert_eq!(cfg.networks, vec!["eth-mainnet", "eth-sepolia"]);
        assert_eq!(cfg.categories, vec!["external", "internal", "erc20"]);
        assert_eq!(cfg.page_size, 10);
        assert_eq!(cfg.buffer_size, 5);
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(15));
        assert_eq!(cfg.rpc_max_attempts, 3);
        assert_eq!(cfg.max_feeds, DEFAULT_MAX_FEEDS);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.rpc_url("eth-sepolia"), "https://eth-sepolia.g.alchemy.com/v2/k");
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let cfg = from_lookup(lookup(&[
            ("ALCHEMY_API_KEY", "k"),
            ("ALCHEMY_NETWORKS", " arb-sepolia , ,base-mainnet"),
            ("PAGE_SIZE", "0"),
            ("BUFFER_SIZE", "lots"),
            ("PORT", "9000"),
            ("MAX_FEEDS", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.networks, vec!["arb-sepolia", "base-mainnet"]);
        assert_eq!(cfg.page_size, 1);
        assert_eq!(cfg.buffer_size, 5);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.max_feeds, 1);
    }

    #[test]
    fn api_key_required() {
        assert!(from_lookup(lookup(&[])).is_err());
        assert!(from_lookup(lookup(&[("ALCHEMY_API_KEY", "  ")])).is_err());
    }
}
