use crate::error::Result;
use crate::rtc::RtcEngine;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use camrelay_protocol::{
    ChannelSummary, ForceUnlockResponse, QueryStateResponse, ViewerCountResponse,
};

pub async fn list_channels<E: RtcEngine>(
    State(state): State<AppState<E>>,
) -> Json<Vec<ChannelSummary>> {
    Json(state.coordinator.list_channels().await)
}

pub async fn force_unlock_viewer<E: RtcEngine>(
    State(state): State<AppState<E>>,
    Path(channel_id): Path<String>,
) -> Result<Json<ForceUnlockResponse>> {
    let released_viewer = state.coordinator.force_unlock_viewer(&channel_id).await?;
    Ok(Json(ForceUnlockResponse {
        ok: true,
        released_viewer,
    }))
}

pub async fn query_state<E: RtcEngine>(
    State(state): State<AppState<E>>,
) -> Json<QueryStateResponse> {
    Json(state.coordinator.query_state().await)
}

pub async fn viewer_count<E: RtcEngine>(
    State(state): State<AppState<E>>,
) -> Json<ViewerCountResponse> {
    Json(ViewerCountResponse {
        count: state.coordinator.viewer_count().await,
    })
}
