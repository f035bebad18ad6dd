use crate::error::SyncError;
use crate::orchestrator::SyncTrigger;
use crate::server::router::CareSyncState;
use crate::sync::{SyncStatusSummary, SyncSummary};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

pub async fn sync_now(
    State(state): State<CareSyncState>,
    Path(user_id): Path<String>,
) -> Result<Json<SyncSummary>, SyncError> {
    state.orchestrator.sync_now(&user_id).await.map(Json)
}

/// A local item changed; sync after the debounce window.
pub async fn schedule_sync(
    State(state): State<CareSyncState>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, SyncError> {
    state.orchestrator.schedule_sync(&user_id, None)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn sync_status(
    State(state): State<CareSyncState>,
    Path(user_id): Path<String>,
) -> Result<Json<SyncStatusSummary>, SyncError> {
    state.service.status(&user_id).await.map(Json)
}

pub async fn resume_sync(
    State(state): State<CareSyncState>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, SyncError> {
    state.service.resume(&user_id).await?;
    state.orchestrator.resume(&user_id)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn item_deleted(
    State(state): State<CareSyncState>,
    Path((user_id, item_id)): Path<(String, String)>,
) -> Result<StatusCode, SyncError> {
    state.service.handle_item_deleted(&user_id, &item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
