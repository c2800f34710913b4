use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ConnectionState, IceServer, SessionDescription};

/// Publisher offer for a channel
///
/// Older camera clients send the channel name as `publisher_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    #[serde(alias = "publisher_id")]
    pub channel_id: String,
    #[serde(flatten)]
    pub offer: SessionDescription,
}

/// Viewer offer targeting a channel
///
/// Older viewer pages send the channel name as `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerRequest {
    #[serde(alias = "target")]
    pub channel_id: String,
    #[serde(flatten)]
    pub offer: SessionDescription,
}

/// Result of an administrative viewer unlock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceUnlockResponse {
    pub ok: bool,
    /// Viewer connection that was evicted, if one was bound
    pub released_viewer: Option<Uuid>,
}

/// One open viewer connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerStateData {
    pub id: Uuid,
    pub state: ConnectionState,
    /// Whether some channel currently holds this connection in its viewer slot
    pub bound: bool,
    pub channel_id: Option<String>,
}

/// Best-effort snapshot of all open viewer connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStateResponse {
    pub viewer_count: usize,
    pub viewers: Vec<ViewerStateData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerCountResponse {
    pub count: usize,
}

/// Operator view of a single channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: String,
    pub publisher_id: Uuid,
    pub publisher_state: ConnectionState,
    pub has_media: bool,
    pub viewer_id: Option<Uuid>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

/// Error body returned for every failed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}
