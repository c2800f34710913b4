//! In-memory engine
//!
//! Connections negotiate instantly and never touch the network. State changes
//! and media arrival are driven by the caller, which makes every interleaving
//! the coordinator has to survive reproducible in tests.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use super::{
    ConnectionState, InboundMedia, InboundMediaHandler, MediaSource, PeerConnection, RtcEngine,
    SdpType, SessionDescription, StateChangeHandler,
};

/// Engine whose connections live entirely in process
pub struct LoopbackEngine {
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
    subscriptions: AtomicUsize,
    fail_connections: AtomicBool,
    fail_negotiation: AtomicBool,
    /// While true, `create_connection` parks
    held: watch::Sender<bool>,
    /// Number of `create_connection` calls currently parked
    parked: watch::Sender<usize>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            subscriptions: AtomicUsize::new(0),
            fail_connections: AtomicBool::new(false),
            fail_negotiation: AtomicBool::new(false),
            held: watch::channel(false).0,
            parked: watch::channel(0).0,
        }
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `create_connection` calls until [`release_connections`](Self::release_connections)
    pub fn hold_connections(&self) {
        self.held.send_replace(true);
    }

    pub fn release_connections(&self) {
        self.held.send_replace(false);
    }

    /// Wait until at least `count` calls are parked, up to `timeout`
    pub async fn wait_for_parked(&self, count: usize, timeout: Duration) -> bool {
        let mut parked = self.parked.subscribe();
        tokio::time::timeout(timeout, parked.wait_for(|parked| *parked >= count))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    /// Make subsequent `create_connection` calls fail
    pub fn fail_connections(&self, fail: bool) {
        self.fail_connections.store(fail, Ordering::SeqCst);
    }

    /// Make connections created from now on reject their offer
    pub fn fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    /// Every connection created so far, in creation order
    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connection(&self, id: Uuid) -> Option<Arc<LoopbackConnection>> {
        self.connections().into_iter().find(|c| c.id == id)
    }

    pub fn last_connection(&self) -> Option<Arc<LoopbackConnection>> {
        self.connections().pop()
    }

    /// Number of relay views handed out
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RtcEngine for LoopbackEngine {
    type Source = LoopbackSource;
    type View = LoopbackView;
    type Connection = LoopbackConnection;

    async fn create_connection(&self) -> Result<Arc<LoopbackConnection>> {
        let held_now = *self.held.borrow();
        if held_now {
            self.parked.send_modify(|parked| *parked += 1);
            let mut held = self.held.subscribe();
            let _ = held.wait_for(|held| !*held).await;
            self.parked.send_modify(|parked| *parked -= 1);
        }

        if self.fail_connections.load(Ordering::SeqCst) {
            bail!("loopback engine refused to create a connection");
        }

        let connection = Arc::new(LoopbackConnection::new(
            self.fail_negotiation.load(Ordering::SeqCst),
        ));
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection.clone());

        Ok(connection)
    }

    async fn subscribe(&self, source: &LoopbackSource) -> Result<LoopbackView> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(LoopbackView {
            id: Uuid::new_v4(),
            source_id: source.id.clone(),
        })
    }
}

/// Stand-in for a publisher's inbound video track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackSource {
    id: String,
}

impl LoopbackSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl MediaSource for LoopbackSource {
    fn source_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackView {
    pub id: Uuid,
    pub source_id: String,
}

pub struct LoopbackConnection {
    id: Uuid,
    state: watch::Sender<ConnectionState>,
    fail_negotiation: bool,
    remote_offer: Mutex<Option<SessionDescription>>,
    attached: Mutex<Vec<LoopbackView>>,
    state_handlers: Mutex<Vec<StateChangeHandler>>,
    media_handlers: Mutex<Vec<InboundMediaHandler<LoopbackSource>>>,
    close_count: AtomicUsize,
}

impl LoopbackConnection {
    fn new(fail_negotiation: bool) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        Self {
            id: Uuid::new_v4(),
            state,
            fail_negotiation,
            remote_offer: Mutex::new(None),
            attached: Mutex::new(Vec::new()),
            state_handlers: Mutex::new(Vec::new()),
            media_handlers: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
        }
    }

    /// Move to `state` and notify handlers, as the engine would. Ignored once
    /// closed or when already in that state.
    pub async fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            self.notify_state(state).await;
        }
    }

    /// Fire the state handlers again without changing state
    pub async fn redeliver(&self, state: ConnectionState) {
        self.notify_state(state).await;
    }

    /// Report inbound media, as when the publisher's track arrives
    pub async fn deliver_media(&self, source: LoopbackSource) {
        self.notify_media(InboundMedia::Started(source)).await;
    }

    pub async fn end_media(&self, source_id: &str) {
        self.notify_media(InboundMedia::Ended(source_id.to_string()))
            .await;
    }

    /// Wait until the connection reaches `target`, up to `timeout`
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        tokio::time::timeout(timeout, state.wait_for(|current| *current == target))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    pub fn is_closed(&self) -> bool {
        *self.state.borrow() == ConnectionState::Closed
    }

    /// Number of times `close` actually transitioned this connection
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn attached_views(&self) -> Vec<LoopbackView> {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remote_offer(&self) -> Option<SessionDescription> {
        self.remote_offer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn notify_state(&self, state: ConnectionState) {
        // Clone out so handlers may re-enter (e.g. close from a handler)
        let handlers = self
            .state_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for handler in handlers {
            handler(state).await;
        }
    }

    async fn notify_media(&self, event: InboundMedia<LoopbackSource>) {
        let handlers = self
            .media_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for handler in handlers {
            handler(event.clone()).await;
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    type Source = LoopbackSource;
    type View = LoopbackView;

    fn id(&self) -> Uuid {
        self.id
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn set_remote_offer(&self, offer: SessionDescription) -> Result<()> {
        if self.is_closed() {
            bail!("connection {} is closed", self.id);
        }
        if self.fail_negotiation {
            bail!("loopback negotiation failure");
        }
        if offer.sdp_type != SdpType::Offer {
            bail!("expected an SDP offer, got {}", offer.sdp_type);
        }

        *self
            .remote_offer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(offer);
        Ok(())
    }

    async fn create_local_answer(&self) -> Result<SessionDescription> {
        if self.is_closed() {
            bail!("connection {} is closed", self.id);
        }
        if self.remote_offer().is_none() {
            bail!("no remote offer set");
        }

        Ok(SessionDescription::answer(format!(
            "v=0\r\no=camrelay-loopback {} 0 IN IP4 127.0.0.1\r\n",
            self.id.as_simple()
        )))
    }

    async fn attach_outbound_media(&self, view: LoopbackView) -> Result<()> {
        if self.is_closed() {
            bail!("connection {} is closed", self.id);
        }

        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(view);
        Ok(())
    }

    fn on_inbound_media(&self, handler: InboundMediaHandler<LoopbackSource>) {
        self.media_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn on_state_change(&self, handler: StateChangeHandler) {
        self.state_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    async fn close(&self) {
        let transitioned = self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed {
                false
            } else {
                *current = ConnectionState::Closed;
                true
            }
        });

        if transitioned {
            self.close_count.fetch_add(1, Ordering::SeqCst);
            self.notify_state(ConnectionState::Closed).await;
        }
    }
}
