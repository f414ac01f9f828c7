use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::aggregator::{AggregatorStats, TransferBatch};
use crate::registry::{AggregatorRegistry, RegistryError};
use crate::source::TransferSource;

#[derive(Deserialize)]
pub struct FeedQuery {
    pub network: String,
    pub address: String,
}

#[derive(Deserialize)]
pub struct BatchQuery {
    pub network: String,
    pub address: String,
    /// Return at once with an empty batch if a load is already running
    #[serde(default)]
    pub no_wait: bool,
}

pub enum ApiError {
    BadRequest(RegistryError),
    NotFound(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::BadRequest(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type Registry<S> = State<Arc<AggregatorRegistry<S>>>;

pub fn router<S: TransferSource>(registry: Arc<AggregatorRegistry<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Transfer feed API running" }))
        .route("/transfers", get(next_batch::<S>).delete(discard::<S>))
        .route("/transfers/reset", post(reset::<S>))
        .route("/transfers/stats", get(stats::<S>))
        .layer(cors)
        .with_state(registry)
}

pub async fn serve<S: TransferSource>(port: u16, registry: Arc<AggregatorRegistry<S>>) -> eyre::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(registry).into_make_service()).await?;

    Ok(())
}

async fn next_batch<S: TransferSource>(
    State(registry): Registry<S>,
    Query(q): Query<BatchQuery>,
) -> Result<Json<TransferBatch>, ApiError> {
    let aggregator = registry.get_or_create(&q.network, &q.address)?;
    let batch = if q.no_wait {
        aggregator.try_get_more_transactions().await
    } else {
        aggregator.get_more_transactions().await
    };
    Ok(Json(batch))
}

async fn reset<S: TransferSource>(
    State(registry): Registry<S>,
    Query(q): Query<FeedQuery>,
) -> Result<Json<AggregatorStats>, ApiError> {
    let aggregator = registry.get_or_create(&q.network, &q.address)?;
    aggregator.reset();
    info!("Feed for {} on {} reset by caller", aggregator.address(), q.network);
    Ok(Json(aggregator.stats()))
}

async fn stats<S: TransferSource>(
    State(registry): Registry<S>,
    Query(q): Query<FeedQuery>,
) -> Result<Json<AggregatorStats>, ApiError> {
    let aggregator = registry
        .get(&q.network, &q.address)?
        .ok_or_else(|| ApiError::NotFound(format!("no feed loaded for {} on {}", q.address, q.network)))?;
    Ok(Json(aggregator.stats()))
}

async fn discard<S: TransferSource>(
    State(registry): Registry<S>,
    Query(q): Query<FeedQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let discarded = registry.discard(&q.network, &q.address)?;
    Ok(Json(json!({ "discarded": discarded, "active": registry.len() })))
}
