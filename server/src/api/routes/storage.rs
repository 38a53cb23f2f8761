//! Query endpoints over the storage engine

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::types::ApiError;
use crate::core::constants::{APP_REVISION, APP_VERSION};
use crate::data::{MetricSeries, MetricsRange, StorageService};

#[derive(Clone)]
pub struct StorageApiState {
    pub storage: Arc<StorageService>,
    pub scraper_enabled: bool,
    pub scraper_period_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    /// Decimal Unix seconds
    pub from: i64,
    /// Decimal Unix seconds
    pub to: i64,
    /// Bucket width in seconds; normalized up to the scraper period
    pub step: u64,
    pub aggregator: Option<String>,
}

/// `GET /storage/metrics?from=S&to=S&step=N`
pub async fn get_metrics(
    State(state): State<StorageApiState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<MetricsRange>, ApiError> {
    let (from, to) = parse_range(&query)?;
    state
        .storage
        .get_metrics(from, to, query.step)
        .await
        .map(Json)
        .map_err(ApiError::from_storage)
}

/// `GET /storage/metrics/{id}?from=S&to=S&step=N&aggregator=NAME`
pub async fn get_metric(
    State(state): State<StorageApiState>,
    Path(id): Path<i64>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<MetricSeries>, ApiError> {
    let (from, to) = parse_range(&query)?;
    let aggregator = query
        .aggregator
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("MISSING_PARAM", "Missing 'aggregator' parameter"))?;

    state
        .storage
        .get_metric(id, from, to, query.step, aggregator)
        .await
        .map(Json)
        .map_err(ApiError::from_storage)
}

/// `GET /status`: application and storage facts for clients.
pub async fn get_status(State(state): State<StorageApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": APP_VERSION,
        "revision": APP_REVISION,
        "config": {
            "scraper": {
                "enabled": state.scraper_enabled,
                "period": state.scraper_period_secs,
            },
        },
        "storage": {
            "hostname": state.storage.hostname(),
            "earliest": state.storage.earliest().map_or(0, |t| t.timestamp()),
            "latest": state.storage.latest().map_or(0, |t| t.timestamp()),
        },
    }))
}

fn parse_range(query: &RangeQuery) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let from = DateTime::from_timestamp(query.from, 0)
        .ok_or_else(|| ApiError::bad_request("INVALID_PARAM", "Invalid 'from' parameter"))?;
    let to = DateTime::from_timestamp(query.to, 0)
        .ok_or_else(|| ApiError::bad_request("INVALID_PARAM", "Invalid 'to' parameter"))?;
    Ok((from, to))
}
