//! Camrelay Server Library
//!
//! Exposes the relay components for testing and embedding.

pub mod api;
pub mod error;
pub mod rtc;
pub mod session;
pub mod state;

use anyhow::Result;
use std::sync::Arc;

use rtc::{RtcEngine, WebRtcEngine};
use state::{AppState, Config};

/// Build the router on top of the webrtc-rs engine
pub fn create_app(config: Config) -> Result<(axum::Router, AppState<WebRtcEngine>)> {
    let engine = Arc::new(WebRtcEngine::new(&config.ice_servers())?);
    Ok(create_app_with_engine(config, engine))
}

/// Build the router on top of any engine
pub fn create_app_with_engine<E: RtcEngine>(
    config: Config,
    engine: Arc<E>,
) -> (axum::Router, AppState<E>) {
    let state = AppState::new(config, engine);
    let router = api::create_router(state.clone());
    (router, state)
}
