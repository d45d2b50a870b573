//! Event ingestion, fan-out, replay, and listing handlers.

use std::{collections::HashMap, time::Duration};

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use hookrelay_core::{
    error::CoreError,
    models::{DeliveryStatus, EndpointId, Event, EventId, Project, ProjectId, SourceId},
    pagination::{Pageable, PageDirection, PaginationData, DEFAULT_PER_PAGE},
    storage::ListFilter,
};
use hookrelay_delivery::planner::RawEvent;

use super::{ApiError, ApiResult};
use crate::AppState;

/// Maximum accepted payload size: 10 MiB.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Body for `POST /projects/{project_id}/events`.
#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    /// Event type matched against subscriptions.
    pub event_type: String,
    /// Single target endpoint.
    pub endpoint_id: Option<EndpointId>,
    /// Multiple target endpoints.
    #[serde(default)]
    pub endpoint_ids: Vec<EndpointId>,
    /// Event payload.
    pub data: serde_json::Value,
    /// Deduplication key.
    pub idempotency_key: Option<String>,
    /// Extra headers forwarded to the endpoint.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    /// Ingest source for incoming projects.
    pub source_id: Option<SourceId>,
    /// Delivery delay in seconds.
    #[serde(default)]
    pub delay_seconds: u64,
    /// Auto-create a match-all subscription for unmatched endpoints.
    #[serde(default)]
    pub create_subscription: bool,
}

/// Body for `POST /projects/{project_id}/events/fanout`.
#[derive(Debug, Deserialize)]
pub struct FanoutEventRequest {
    /// Event type matched against subscriptions.
    pub event_type: String,
    /// Event payload.
    pub data: serde_json::Value,
    /// Deduplication key.
    pub idempotency_key: Option<String>,
    /// Extra headers forwarded to the endpoints.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
}

/// Shared listing query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Opaque page cursor.
    pub cursor: Option<Uuid>,
    /// Page size.
    pub per_page: Option<i64>,
    /// Paging direction.
    pub direction: Option<PageDirection>,
    /// Single endpoint filter.
    pub endpoint_id: Option<EndpointId>,
    /// Comma-separated endpoint id list.
    pub endpoint_ids: Option<String>,
    /// Single source filter.
    pub source_id: Option<SourceId>,
    /// Restrict deliveries to one event.
    pub event_id: Option<EventId>,
    /// Comma-separated delivery status list.
    pub status: Option<String>,
    /// Idempotency key filter.
    pub idempotency_key: Option<String>,
    /// Inclusive start date (`YYYY-MM-DDTHH:MM:SS`).
    pub start_date: Option<String>,
    /// Inclusive end date (`YYYY-MM-DDTHH:MM:SS`).
    pub end_date: Option<String>,
    /// Full-text search query.
    pub query: Option<String>,
}

impl ListQuery {
    /// Converts the raw query into a row filter.
    pub fn to_filter(&self) -> ApiResult<ListFilter> {
        let mut endpoint_ids: Vec<EndpointId> = Vec::new();
        if let Some(id) = self.endpoint_id {
            endpoint_ids.push(id);
        }
        if let Some(ids) = &self.endpoint_ids {
            for id in ids.split(',').filter(|s| !s.is_empty()) {
                endpoint_ids.push(id.parse().map_err(|_| {
                    ApiError(CoreError::validation(format!("invalid endpoint id: {id}")))
                })?);
            }
        }

        let mut statuses = Vec::new();
        if let Some(list) = &self.status {
            for status in list.split(',').filter(|s| !s.is_empty()) {
                statuses.push(status.parse::<DeliveryStatus>().map_err(|e| {
                    ApiError(CoreError::validation(e))
                })?);
            }
        }

        Ok(ListFilter {
            endpoint_ids,
            source_ids: self.source_id.into_iter().collect(),
            event_id: self.event_id,
            statuses,
            idempotency_key: self.idempotency_key.clone(),
            created_at_start: parse_date(self.start_date.as_deref())?,
            created_at_end: parse_date(self.end_date.as_deref())?,
            query: self.query.clone(),
        })
    }

    /// Converts the raw query into a page request.
    pub fn to_pageable(&self) -> Pageable {
        Pageable {
            cursor: self.cursor,
            per_page: self.per_page.unwrap_or(DEFAULT_PER_PAGE),
            direction: self.direction.unwrap_or_default(),
        }
        .clamped()
    }
}

fn parse_date(value: Option<&str>) -> ApiResult<Option<DateTime<Utc>>> {
    let Some(value) = value else { return Ok(None) };
    let parsed = NaiveDateTime::parse_from_str(value, DATE_FORMAT).map_err(|_| {
        ApiError(CoreError::validation(format!(
            "dates must use the format {DATE_FORMAT}: {value}"
        )))
    })?;
    Ok(Some(parsed.and_utc()))
}

/// Paged listing envelope.
#[derive(Debug, Serialize)]
pub struct PagedResponse<T> {
    /// Page rows.
    pub content: Vec<T>,
    /// Paging metadata.
    pub pagination: PaginationData,
}

pub(crate) async fn load_project(state: &AppState, id: ProjectId) -> ApiResult<Project> {
    Ok(state.storage.projects.must_find_by_id(id).await?)
}

/// Captures ingest headers worth forwarding to endpoints.
fn forwardable_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if let Ok(value) = value.to_str() {
            if name.starts_with("x-") && !name.starts_with("x-hookrelay") {
                map.insert(name.to_string(), value.to_string());
            }
        }
    }
    map
}

/// Creates one event and fans it out to its target endpoints.
///
/// Fan-out runs synchronously: the event and its deliveries are persisted
/// and enqueued before the response returns.
#[instrument(name = "create_event", skip(state, headers, request), fields(project_id = %project_id))]
pub async fn create_event(
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    Json(request): Json<CreateEventRequest>,
) -> ApiResult<impl IntoResponse> {
    let project = load_project(&state, project_id).await?;

    let raw = serde_json::to_string(&request.data)
        .map_err(|e| ApiError(CoreError::validation(e.to_string())))?;
    if raw.len() > MAX_PAYLOAD_SIZE {
        return Err(ApiError(CoreError::validation(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit",
            raw.len()
        ))));
    }

    let mut event_headers = forwardable_headers(&headers);
    event_headers.extend(request.custom_headers.clone());

    let mut endpoint_ids = request.endpoint_ids.clone();
    if let Some(id) = request.endpoint_id {
        endpoint_ids.push(id);
    }

    let result = state
        .planner
        .plan(&project, RawEvent {
            event_type: request.event_type,
            endpoint_ids,
            source_id: request.source_id,
            data: request.data,
            raw,
            headers: event_headers,
            url_query_params: raw_query,
            idempotency_key: request.idempotency_key,
            create_subscription: request.create_subscription,
            delay: Duration::from_secs(request.delay_seconds),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(result.event)))
}

/// Creates one event across every endpoint in the project.
#[instrument(name = "create_fanout_event", skip(state, headers, request), fields(project_id = %project_id))]
pub async fn create_fanout_event(
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    Json(request): Json<FanoutEventRequest>,
) -> ApiResult<impl IntoResponse> {
    let project = load_project(&state, project_id).await?;

    let raw = serde_json::to_string(&request.data)
        .map_err(|e| ApiError(CoreError::validation(e.to_string())))?;

    let mut event_headers = forwardable_headers(&headers);
    event_headers.extend(request.custom_headers.clone());

    let result = state
        .planner
        .plan(&project, RawEvent {
            event_type: request.event_type,
            endpoint_ids: Vec::new(),
            source_id: None,
            data: request.data,
            raw,
            headers: event_headers,
            url_query_params: raw_query,
            idempotency_key: request.idempotency_key,
            create_subscription: false,
            delay: Duration::ZERO,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(result.event)))
}

/// Fetches one event.
pub async fn get_event(
    Path((project_id, event_id)): Path<(ProjectId, EventId)>,
    State(state): State<AppState>,
) -> ApiResult<Json<Event>> {
    let event = state.storage.events.must_find_by_id(project_id, event_id).await?;
    Ok(Json(event))
}

/// Regenerates deliveries for one event against current subscriptions.
#[instrument(name = "replay_event", skip(state), fields(project_id = %project_id, event_id = %event_id))]
pub async fn replay_event(
    Path((project_id, event_id)): Path<(ProjectId, EventId)>,
    State(state): State<AppState>,
) -> ApiResult<Json<Event>> {
    let project = load_project(&state, project_id).await?;
    state.replay.replay_event(&project, event_id).await?;

    let event = state.storage.events.must_find_by_id(project_id, event_id).await?;
    Ok(Json(event))
}

/// Replays every event matching the filter.
#[instrument(name = "batch_replay_events", skip(state, query), fields(project_id = %project_id))]
pub async fn batch_replay_events(
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let project = load_project(&state, project_id).await?;
    let filter = query.to_filter()?;

    let summary = state.replay.batch_replay(&project, &filter).await?;
    Ok(Json(summary))
}

/// Counts events a batch replay would touch.
pub async fn count_events(
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = query.to_filter()?;
    let count = state.storage.events.count(project_id, &filter).await?;
    Ok(Json(serde_json::json!({ "num": count })))
}

/// Pages events, newest first.
pub async fn list_events(
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<PagedResponse<Event>>> {
    let filter = query.to_filter()?;
    let pageable = query.to_pageable();

    let (events, pagination) =
        state.storage.events.list_paged(project_id, &filter, pageable).await?;
    Ok(Json(PagedResponse { content: events, pagination }))
}
