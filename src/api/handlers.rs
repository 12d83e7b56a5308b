use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::alerts::{Alert, AlertEngine};
use crate::analytics::views::{
    CompareView, CustomReportQuery, CustomReportView, DeviceView, GeographicView, PerformanceView,
    ReferrerView, SummaryView, TimelineView, UserOverview,
};
use crate::analytics::{authorize, AggregationEngine, Dimension, EventFilter};
use crate::api::error::ApiError;
use crate::auth::Caller;
use crate::cursor::{CursorSigner, EventCursor};
use crate::error::AnalyticsError;
use crate::models::{ClickEvent, DateWindow, Granularity, RollupPeriod, RollupRecord};
use crate::scheduler::{BatchRollupScheduler, RunRecord};
use crate::storage::{EventStore, LinkRepository, RollupStore};
use crate::trends::{TrendEngine, TrendPeriod, TrendRecord};

pub struct AppState {
    pub engine: Arc<AggregationEngine>,
    pub trends: Arc<TrendEngine>,
    pub alerts: Arc<AlertEngine>,
    pub store: Arc<dyn EventStore>,
    pub links: Arc<dyn LinkRepository>,
    pub rollups: Arc<dyn RollupStore>,
    pub cursors: Arc<CursorSigner>,
    /// Absent when the scheduler is disabled
    pub scheduler: Option<Arc<BatchRollupScheduler>>,
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl WindowQuery {
    pub fn window(&self) -> Result<Option<DateWindow>, AnalyticsError> {
        window_of(&self.start_date, &self.end_date)
    }
}

fn window_of(
    start: &Option<String>,
    end: &Option<String>,
) -> Result<Option<DateWindow>, AnalyticsError> {
    DateWindow::from_params(start.as_deref(), end.as_deref())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineQuery {
    pub granularity: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareQuery {
    pub ids: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TrendingQuery {
    pub period: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupQuery {
    pub period: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub cursor: Option<String>,
    #[serde(default = "default_page_size")]
    pub limit: usize,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

fn default_page_size() -> usize {
    100
}

const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub link_ids: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    pub events: Vec<ClickEvent>,
    pub next_cursor: Option<String>,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn get_summary(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(link_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<SummaryView> {
    let view = state
        .engine
        .summary(caller.id(), &link_id, query.window()?)
        .await?;
    Ok(Json(view))
}

pub async fn get_geographic(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(link_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<GeographicView> {
    let view = state
        .engine
        .geographic(caller.id(), &link_id, query.window()?)
        .await?;
    Ok(Json(view))
}

pub async fn get_devices(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(link_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<DeviceView> {
    let view = state
        .engine
        .device(caller.id(), &link_id, query.window()?)
        .await?;
    Ok(Json(view))
}

pub async fn get_referrers(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(link_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<ReferrerView> {
    let view = state
        .engine
        .referrer(caller.id(), &link_id, query.window()?)
        .await?;
    Ok(Json(view))
}

pub async fn get_timeline(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(link_id): Path<String>,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<TimelineView> {
    let granularity = match query.granularity.as_deref() {
        Some(g) => g.parse::<Granularity>()?,
        None => Granularity::default(),
    };
    let window = window_of(&query.start_date, &query.end_date)?;
    let view = state
        .engine
        .timeline(caller.id(), &link_id, window, granularity)
        .await?;
    Ok(Json(view))
}

pub async fn get_performance(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(link_id): Path<String>,
) -> ApiResult<PerformanceView> {
    Ok(Json(state.engine.performance(caller.id(), &link_id).await?))
}

pub async fn get_link_alerts(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(link_id): Path<String>,
) -> ApiResult<Vec<Alert>> {
    Ok(Json(state.alerts.for_link(caller.id(), &link_id).await?))
}

pub async fn get_rollups(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(link_id): Path<String>,
    Query(query): Query<RollupQuery>,
) -> ApiResult<Vec<RollupRecord>> {
    let period = match query.period.as_deref() {
        Some(p) => p.parse::<RollupPeriod>()?,
        None => RollupPeriod::Day,
    };
    let window = window_of(&query.start_date, &query.end_date)?;
    authorize(state.links.as_ref(), caller.id(), &link_id).await?;
    let records = state.rollups.list_rollups(&link_id, period, window).await?;
    Ok(Json(records))
}

/// Keyset paging over raw events with a signed cursor
pub async fn get_events(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(link_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<EventsPage> {
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
    let window = window_of(&query.start_date, &query.end_date)?;
    let after = query
        .cursor
        .as_deref()
        .map(|c| state.cursors.decode(c))
        .transpose()
        .map_err(|e| AnalyticsError::validation(format!("invalid cursor: {e}")))?;
    authorize(state.links.as_ref(), caller.id(), &link_id).await?;

    let events = state
        .store
        .events_page(&EventFilter::link(&link_id, window), after, limit)
        .await?;
    let next_cursor = match events.last() {
        Some(last) if events.len() == limit => {
            Some(state.cursors.encode(&EventCursor::after(last))?)
        }
        _ => None,
    };

    Ok(Json(EventsPage {
        events,
        next_cursor,
    }))
}

pub async fn compare_links(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<CompareQuery>,
) -> ApiResult<CompareView> {
    let ids: Vec<String> = query
        .ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    let view = state
        .engine
        .compare(caller.id(), &ids, window_of(&query.start_date, &query.end_date)?)
        .await?;
    Ok(Json(view))
}

pub async fn create_report(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<ReportRequest>,
) -> ApiResult<CustomReportView> {
    let dimensions = request
        .dimensions
        .iter()
        .map(|d| d.parse::<Dimension>())
        .collect::<Result<Vec<_>, _>>()?;
    let query = CustomReportQuery {
        link_ids: request.link_ids,
        dimensions,
        window: window_of(&request.start_date, &request.end_date)?,
    };
    Ok(Json(state.engine.custom_report(caller.id(), query).await?))
}

pub async fn get_overview(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<UserOverview> {
    let view = state
        .engine
        .user_overview(caller.id(), query.window()?)
        .await?;
    Ok(Json(view))
}

pub async fn get_trending(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<TrendingQuery>,
) -> ApiResult<Vec<TrendRecord>> {
    let period = match query.period.as_deref() {
        Some(p) => p.parse::<TrendPeriod>()?,
        None => TrendPeriod::default(),
    };
    let records = state
        .trends
        .get_for_user(caller.id(), period, query.limit)
        .await?;
    Ok(Json(records))
}

pub async fn get_user_alerts(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Vec<Alert>> {
    Ok(Json(state.alerts.for_user(caller.id()).await?))
}

pub async fn get_job_history(State(state): State<Arc<AppState>>) -> Json<Vec<RunRecord>> {
    let history = match &state.scheduler {
        Some(scheduler) => scheduler.history().await,
        None => Vec::new(),
    };
    Json(history)
}
