use crate::dtos::UpdatePodStatusRequest;
use crate::models::{NewPod, Pod, PodSearch, PodSearchResult};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

pub async fn create_pod(
    State(state): State<AppState>,
    Json(payload): Json<NewPod>,
) -> Result<(StatusCode, Json<Pod>), AppError> {
    let pod = state.db.create_pod(&payload).await?;
    Ok((StatusCode::CREATED, Json(pod)))
}

pub async fn get_pod(
    State(state): State<AppState>,
    Path(pod_id): Path<Uuid>,
) -> Result<Json<Pod>, AppError> {
    Ok(Json(state.db.get_pod(pod_id).await?))
}

pub async fn update_pod_status(
    State(state): State<AppState>,
    Path(pod_id): Path<Uuid>,
    Json(payload): Json<UpdatePodStatusRequest>,
) -> Result<Json<Pod>, AppError> {
    tracing::info!(pod_id = %pod_id, status = payload.status.as_str(), "Updating pod status");
    Ok(Json(state.db.update_pod_status(pod_id, payload.status).await?))
}

pub async fn search_pods(
    State(state): State<AppState>,
    Query(search): Query<PodSearch>,
) -> Result<Json<Vec<PodSearchResult>>, AppError> {
    Ok(Json(state.reservations.search_pods(&search).await?))
}
