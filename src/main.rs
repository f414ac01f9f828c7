mod aggregator;
mod api;
mod config;
mod feed;
mod models;
mod registry;
mod rpc;
mod source;
#[cfg(test)]
mod test_helpers;

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::registry::AggregatorRegistry;
use crate::rpc::AlchemyClient;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    info!("Transfer feed starting...");

    let cfg = config::load()?;

    // one Alchemy client per network; aggregators share their network's client
    let mut registry = AggregatorRegistry::new(cfg.aggregator_options()).with_max_feeds(cfg.max_feeds);
    for network in &cfg.networks {
        let client = AlchemyClient::new(
            cfg.rpc_url(network),
            cfg.categories.clone(),
            cfg.rpc_timeout,
            cfg.rpc_max_attempts,
        )?;
        registry = registry.with_source(network.clone(), Arc::new(client));
    }
    let registry = Arc::new(registry);
    info!("Serving networks: {:?}", registry.networks());

    let api_handle = tokio::spawn({
        let registry = Arc::clone(&registry);
        let port = cfg.port;
        async move { api::serve(port, registry).await }
    });

    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("Transfer feed stopped.");
    Ok(())
}
