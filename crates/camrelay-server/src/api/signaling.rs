use crate::error::Result;
use crate::rtc::{RtcEngine, SessionDescription};
use crate::state::AppState;
use axum::{Json, extract::State};
use camrelay_protocol::{PublishRequest, ViewerRequest};

pub async fn publish<E: RtcEngine>(
    State(state): State<AppState<E>>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<SessionDescription>> {
    tracing::info!(channel = %request.channel_id, "Publish request");
    let answer = state
        .coordinator
        .publish(&request.channel_id, request.offer)
        .await?;
    Ok(Json(answer))
}

pub async fn connect_viewer<E: RtcEngine>(
    State(state): State<AppState<E>>,
    Json(request): Json<ViewerRequest>,
) -> Result<Json<SessionDescription>> {
    tracing::info!(channel = %request.channel_id, "Viewer request");
    let answer = state
        .coordinator
        .connect_viewer(&request.channel_id, request.offer)
        .await?;
    Ok(Json(answer))
}
