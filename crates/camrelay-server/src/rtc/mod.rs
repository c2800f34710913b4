//! Media transport seam
//!
//! The session coordinator never talks to a WebRTC stack directly. It drives
//! an [`RtcEngine`], which hands out [`PeerConnection`]s and relay views of
//! live inbound media. `webrtc_engine` is the production implementation on
//! top of webrtc-rs; `loopback` is an in-memory engine used by the tests.

pub mod loopback;
pub mod track_relay;
pub mod webrtc_engine;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use uuid::Uuid;

pub use camrelay_protocol::{ConnectionState, SdpType, SessionDescription};
pub use loopback::LoopbackEngine;
pub use webrtc_engine::WebRtcEngine;

/// Inbound media event reported by a publisher's connection
#[derive(Debug, Clone)]
pub enum InboundMedia<S> {
    /// A live source arrived and can be relayed
    Started(S),
    /// The source with this id stopped producing media
    Ended(String),
}

/// Callback fired on every connection state change
pub type StateChangeHandler = Arc<dyn Fn(ConnectionState) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback fired when inbound media starts or ends
pub type InboundMediaHandler<S> = Arc<dyn Fn(InboundMedia<S>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A live inbound media handle that relay views can be cut from
pub trait MediaSource: Clone + Send + Sync + 'static {
    fn source_id(&self) -> &str;
}

/// One negotiated peer session
///
/// Handlers run on the engine's own tasks and must be treated as independent
/// entry points, not continuations of the call that created the connection.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    type Source: MediaSource;
    type View: Clone + Send + Sync + 'static;

    /// Stable identity, unique per engine
    fn id(&self) -> Uuid;

    fn connection_state(&self) -> ConnectionState;

    async fn set_remote_offer(&self, offer: SessionDescription) -> Result<()>;

    async fn create_local_answer(&self) -> Result<SessionDescription>;

    async fn attach_outbound_media(&self, view: Self::View) -> Result<()>;

    fn on_inbound_media(&self, handler: InboundMediaHandler<Self::Source>);

    fn on_state_change(&self, handler: StateChangeHandler);

    /// Idempotent. Failures are logged, never returned.
    async fn close(&self);
}

/// Connection factory plus relay
#[async_trait]
pub trait RtcEngine: Send + Sync + 'static {
    type Source: MediaSource;
    type View: Clone + Send + Sync + 'static;
    type Connection: PeerConnection<Source = Self::Source, View = Self::View>;

    async fn create_connection(&self) -> Result<Arc<Self::Connection>>;

    /// Cut a fresh, independently droppable view from a live source
    async fn subscribe(&self, source: &Self::Source) -> Result<Self::View>;
}

/// Feed an offer into a connection and produce its answer
pub async fn negotiate<C: PeerConnection>(
    connection: &C,
    offer: SessionDescription,
) -> Result<SessionDescription> {
    connection.set_remote_offer(offer).await?;
    connection.create_local_answer().await
}
