use crate::rtc::RtcEngine;
use crate::state::AppState;
use axum::{Json, extract::State};
use camrelay_protocol::IceServersResponse;

pub async fn get_ice_servers<E: RtcEngine>(
    State(state): State<AppState<E>>,
) -> Json<IceServersResponse> {
    Json(IceServersResponse {
        ice_servers: state.config.ice_servers(),
    })
}
