//! Read endpoints over the stats store, top lists cached

use axum::{
    extract::{Path, Query, State},
    response::Redirect,
    Json,
};
use cached::proc_macro::cached;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::ApiError;
use super::AppState;
use crate::db::{
    DatasetMetric, DatasetTotal, Database, LocationFilter, LocationTotal, MonthlySessions, ResourceTotal, SortOrder,
};

/// Limit applied to top lists when the request gives none
pub const DEFAULT_TOP_LIMIT: i64 = 20;

/// Days covered by a range query without an explicit start
const DEFAULT_RANGE_DAYS: i64 = 30;

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Inclusive day range; defaults to the 30 days up to today
fn resolve_range(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<(NaiveDate, NaiveDate), ApiError> {
    let end = end.unwrap_or_else(today);
    let start = start.unwrap_or(end - Duration::days(DEFAULT_RANGE_DAYS));
    if start > end {
        return Err(ApiError::bad_request(format!("start {} is after end {}", start, end)));
    }
    Ok((start, end))
}

fn optional_limit(limit: Option<i64>) -> Result<Option<i64>, ApiError> {
    match limit {
        Some(n) if n < 1 => Err(ApiError::bad_request("limit must be at least 1")),
        limit => Ok(limit),
    }
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DatasetsQuery {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub limit: Option<i64>,
    pub order: Option<String>,
    pub sort: Option<String>,
}

fn parse_order(raw: Option<&str>) -> Result<SortOrder, ApiError> {
    match raw {
        None | Some("desc") => Ok(SortOrder::Descending),
        Some("asc") => Ok(SortOrder::Ascending),
        Some(other) => Err(ApiError::bad_request(format!("unknown order '{}'", other))),
    }
}

fn parse_metric(raw: Option<&str>) -> Result<DatasetMetric, ApiError> {
    match raw {
        None | Some("visits") => Ok(DatasetMetric::Visits),
        Some("entrances") => Ok(DatasetMetric::Entrances),
        Some("downloads") => Ok(DatasetMetric::Downloads),
        Some(other) => Err(ApiError::bad_request(format!("unknown sort metric '{}'", other))),
    }
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    pub limit: Option<i64>,
}

impl TopQuery {
    fn limit(&self) -> Result<i64, ApiError> {
        match self.limit {
            None => Ok(DEFAULT_TOP_LIMIT),
            Some(n) if n < 1 => Err(ApiError::bad_request("limit must be at least 1")),
            Some(n) => Ok(n),
        }
    }
}

/// Dataset totals as served; downloads are left out when hidden
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStats {
    pub dataset_id: String,
    pub name: Option<String>,
    pub visits: i64,
    pub entrances: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads: Option<i64>,
}

impl DatasetStats {
    fn from_total(total: DatasetTotal, show_downloads: bool) -> Self {
        Self {
            dataset_id: total.dataset_id,
            name: total.name,
            visits: total.visits,
            entrances: total.entrances,
            downloads: show_downloads.then_some(total.downloads),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DayActivity {
    pub day: NaiveDate,
    pub visits: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub dataset_id: String,
    pub days: Vec<DayActivity>,
    pub total_visits: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_downloads: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub sessions: i64,
}

/// Top datasets - 5 minute TTL
#[cached(time = 300, key = "i64", convert = r#"{ limit }"#, result = true)]
async fn get_cached_top_datasets(limit: i64, db: Database) -> Result<Vec<DatasetTotal>, anyhow::Error> {
    db.top_datasets(limit).await
}

/// Top resources - 5 minute TTL
#[cached(time = 300, key = "i64", convert = r#"{ limit }"#, result = true)]
async fn get_cached_top_resources(limit: i64, db: Database) -> Result<Vec<ResourceTotal>, anyhow::Error> {
    db.top_resources(limit).await
}

/// Top locations - 5 minute TTL
#[cached(time = 300, key = "i64", convert = r#"{ limit }"#, result = true)]
async fn get_cached_top_locations(limit: i64, db: Database) -> Result<Vec<LocationTotal>, anyhow::Error> {
    db.top_locations(limit).await
}

/// GET /api/stats/datasets
pub async fn api_datasets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DatasetsQuery>,
) -> Result<Json<Vec<DatasetStats>>, ApiError> {
    let (start, end) = resolve_range(query.start, query.end)?;
    let limit = optional_limit(query.limit)?;
    let order = parse_order(query.order.as_deref())?;
    let sort_by = parse_metric(query.sort.as_deref())?;
    if sort_by == DatasetMetric::Downloads && !state.show_downloads {
        return Err(ApiError::bad_request("download counts are not available"));
    }

    let totals = state.db.dataset_totals(start, end, limit, order, sort_by).await?;
    Ok(Json(
        totals
            .into_iter()
            .map(|t| DatasetStats::from_total(t, state.show_downloads))
            .collect(),
    ))
}

/// GET /api/stats/datasets/top
pub async fn api_top_datasets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<DatasetStats>>, ApiError> {
    let totals = get_cached_top_datasets(query.limit()?, state.db.clone()).await?;
    Ok(Json(
        totals
            .into_iter()
            .map(|t| DatasetStats::from_total(t, state.show_downloads))
            .collect(),
    ))
}

/// GET /api/stats/datasets/:id/visits
pub async fn api_dataset_activity(
    State(state): State<Arc<AppState>>,
    Path(dataset_id): Path<String>,
) -> Result<Json<ActivityResponse>, ApiError> {
    let activity = state.db.dataset_activity(&dataset_id, today()).await?;
    let show = state.show_downloads;

    Ok(Json(ActivityResponse {
        dataset_id,
        days: activity
            .days
            .into_iter()
            .map(|d| DayActivity {
                day: d.day,
                visits: d.visits,
                downloads: show.then_some(d.downloads),
            })
            .collect(),
        total_visits: activity.total_visits,
        total_downloads: show.then_some(activity.total_downloads),
    }))
}

/// GET /api/stats/resources
pub async fn api_resources(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<ResourceTotal>>, ApiError> {
    let (start, end) = resolve_range(query.start, query.end)?;
    Ok(Json(state.db.resource_totals(start, end, optional_limit(query.limit)?).await?))
}

/// GET /api/stats/resources/top
pub async fn api_top_resources(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<ResourceTotal>>, ApiError> {
    Ok(Json(get_cached_top_resources(query.limit()?, state.db.clone()).await?))
}

/// GET /api/stats/locations/top
pub async fn api_top_locations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<LocationTotal>>, ApiError> {
    Ok(Json(get_cached_top_locations(query.limit()?, state.db.clone()).await?))
}

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub location: Option<String>,
}

/// GET /api/stats/locations/sessions
pub async fn api_location_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let (start, end) = resolve_range(query.start, query.end)?;
    let filter = LocationFilter::parse(query.location.as_deref());
    let sessions = state.db.location_sessions(start, end, &filter).await?;
    Ok(Json(SessionsResponse { start, end, sessions }))
}

/// GET /api/stats/locations/monthly
pub async fn api_monthly_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<MonthlySessions>>, ApiError> {
    let (start, end) = resolve_range(query.start, query.end)?;
    Ok(Json(state.db.sessions_by_month(start, end).await?))
}

/// Path of a resource download; a trailing file name segment is ignored
#[derive(Debug, Deserialize)]
pub struct DownloadPath {
    pub id: String,
    pub resource_id: String,
}

/// GET /dataset/:id/resource/:resource_id/download[/:filename]
///
/// Redirects to the stored file. The tracking layer records the download
/// before this runs.
pub async fn resource_download(
    State(state): State<Arc<AppState>>,
    Path(path): Path<DownloadPath>,
) -> Result<Redirect, ApiError> {
    match state.db.resource_url(&path.id, &path.resource_id).await? {
        Some(url) => Ok(Redirect::to(&url)),
        None => Err(ApiError::not_found(format!("no downloadable resource '{}'", path.resource_id))),
    }
}

/// Warm the top-list caches (called on startup)
pub async fn warm_cache(db: &Database) {
    tracing::info!("Warming top-list caches (limit {})...", DEFAULT_TOP_LIMIT);

    let (datasets, resources, locations) = tokio::join!(
        get_cached_top_datasets(DEFAULT_TOP_LIMIT, db.clone()),
        get_cached_top_resources(DEFAULT_TOP_LIMIT, db.clone()),
        get_cached_top_locations(DEFAULT_TOP_LIMIT, db.clone())
    );
    if datasets.is_err() || resources.is_err() || locations.is_err() {
        tracing::warn!("Cache warm-up incomplete; lists are loaded on first request");
    }
}
