//! Event delivery listing, resend, and batch retry handlers.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::instrument;

use hookrelay_core::models::{DeliveryAttempt, DeliveryId, EventDelivery, ProjectId};

use super::{
    events::{load_project, ListQuery, PagedResponse},
    ApiResult,
};
use crate::AppState;

/// Body for `POST /projects/{project_id}/eventdeliveries/forceresend`.
#[derive(Debug, Deserialize)]
pub struct ForceResendRequest {
    /// Deliveries to force-resend.
    pub ids: Vec<DeliveryId>,
}

/// Fetches one delivery.
pub async fn get_delivery(
    Path((project_id, delivery_id)): Path<(ProjectId, DeliveryId)>,
    State(state): State<AppState>,
) -> ApiResult<Json<EventDelivery>> {
    let delivery =
        state.storage.event_deliveries.must_find_by_id(project_id, delivery_id).await?;
    Ok(Json(delivery))
}

/// Pages deliveries, newest first.
pub async fn list_deliveries(
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<PagedResponse<EventDelivery>>> {
    let filter = query.to_filter()?;
    let pageable = query.to_pageable();

    let (deliveries, pagination) =
        state.storage.event_deliveries.list_paged(project_id, &filter, pageable).await?;
    Ok(Json(PagedResponse { content: deliveries, pagination }))
}

/// Resends a single terminal delivery.
#[instrument(name = "resend_delivery", skip(state), fields(project_id = %project_id, delivery_id = %delivery_id))]
pub async fn resend_delivery(
    Path((project_id, delivery_id)): Path<(ProjectId, DeliveryId)>,
    State(state): State<AppState>,
) -> ApiResult<Json<EventDelivery>> {
    let project = load_project(&state, project_id).await?;
    let delivery = state.replay.resend_delivery(&project, delivery_id).await?;
    Ok(Json(delivery))
}

/// Force-resends a set of deliveries, skipping state checks.
#[instrument(name = "force_resend_deliveries", skip(state, request), fields(project_id = %project_id))]
pub async fn force_resend_deliveries(
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState>,
    Json(request): Json<ForceResendRequest>,
) -> ApiResult<impl IntoResponse> {
    let project = load_project(&state, project_id).await?;
    let summary = state.replay.force_resend(&project, &request.ids).await?;
    Ok(Json(summary))
}

/// Retries every delivery matching the filter.
#[instrument(name = "batch_retry_deliveries", skip(state, query), fields(project_id = %project_id))]
pub async fn batch_retry_deliveries(
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let project = load_project(&state, project_id).await?;
    let filter = query.to_filter()?;
    let summary = state.replay.batch_retry(&project, &filter).await?;
    Ok(Json(summary))
}

/// Lists the attempts of one delivery, oldest first.
pub async fn list_delivery_attempts(
    Path((project_id, delivery_id)): Path<(ProjectId, DeliveryId)>,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<DeliveryAttempt>>> {
    // 404 on unknown delivery rather than an empty attempt list.
    state.storage.event_deliveries.must_find_by_id(project_id, delivery_id).await?;
    let attempts = state.storage.delivery_attempts.find_by_delivery(delivery_id).await?;
    Ok(Json(attempts))
}

/// Counts deliveries a batch retry would touch.
pub async fn count_deliveries(
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = query.to_filter()?;
    let count = state.storage.event_deliveries.count(project_id, &filter).await?;
    Ok(Json(serde_json::json!({ "num": count })))
}
