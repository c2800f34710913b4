//! Session coordinator
//!
//! Pairs one publisher with at most one viewer per channel. Request handlers
//! and connection state callbacks all mutate the same channel records, so
//! every read-modify-write of a record happens under its lock, and no lock is
//! ever held across a call into the media engine. Wherever a slot is released
//! the current occupant is compared against the caller's connection first, so
//! late or duplicate notifications cannot evict a newer occupant.

use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use uuid::Uuid;

use camrelay_protocol::{ChannelSummary, QueryStateResponse, ViewerStateData};

use super::registry::{ChannelRecord, ChannelRegistry, ViewerSlot};
use super::viewers::ViewerRegistry;
use crate::error::{AppError, Result};
use crate::rtc::{
    ConnectionState, InboundMedia, MediaSource, PeerConnection, RtcEngine, SdpType,
    SessionDescription, negotiate,
};

type Record<E> = Arc<ChannelRecord<E>>;
type Connection<E> = Arc<<E as RtcEngine>::Connection>;

pub struct SessionCoordinator<E: RtcEngine> {
    inner: Arc<Inner<E>>,
}

struct Inner<E: RtcEngine> {
    engine: Arc<E>,
    channels: ChannelRegistry<E>,
    viewers: ViewerRegistry<E::Connection>,
}

impl<E: RtcEngine> Clone for SessionCoordinator<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: RtcEngine> SessionCoordinator<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                channels: ChannelRegistry::new(),
                viewers: ViewerRegistry::new(),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.inner.engine
    }

    pub fn channels(&self) -> &ChannelRegistry<E> {
        &self.inner.channels
    }

    pub fn viewers(&self) -> &ViewerRegistry<E::Connection> {
        &self.inner.viewers
    }

    /// Accept a publisher offer for `channel_id`, replacing any previous publisher
    ///
    /// Runs on its own task: dropping the returned future does not interrupt
    /// the bookkeeping, and a publisher whose answer nobody receives is retired.
    pub async fn publish(
        &self,
        channel_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let inner = self.inner.clone();
        let channel_id = channel_id.to_string();
        let (reply_tx, reply_rx) = oneshot::channel();

        tokio::spawn(async move {
            match inner.publish(&channel_id, offer).await {
                Ok((answer, record)) => {
                    if reply_tx.send(Ok(answer)).is_err() {
                        tracing::warn!(
                            channel = %channel_id,
                            publisher = %record.publisher_id(),
                            "Publish request abandoned, retiring channel"
                        );
                        inner.retire(&record).await;
                    }
                }
                Err(e) => {
                    let _ = reply_tx.send(Err(e));
                }
            }
        });

        reply_rx.await.map_err(|_| abandoned_task("publish"))?
    }

    /// Bind a viewer to the channel's publisher, if the slot is free
    ///
    /// Runs on its own task like [`publish`](Self::publish); a viewer whose
    /// answer nobody receives gives its slot back.
    pub async fn connect_viewer(
        &self,
        channel_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let inner = self.inner.clone();
        let channel_id = channel_id.to_string();
        let (reply_tx, reply_rx) = oneshot::channel();

        tokio::spawn(async move {
            match inner.connect_viewer(&channel_id, offer).await {
                Ok((answer, record, connection)) => {
                    if reply_tx.send(Ok(answer)).is_err() {
                        tracing::warn!(
                            channel = %channel_id,
                            viewer = %connection.id(),
                            "Viewer request abandoned, releasing slot"
                        );
                        inner.release_viewer(&record, &connection).await;
                    }
                }
                Err(e) => {
                    let _ = reply_tx.send(Err(e));
                }
            }
        });

        reply_rx.await.map_err(|_| abandoned_task("viewer connect"))?
    }

    /// Evict the channel's viewer without touching its publisher.
    /// Returns the evicted connection id, if one was bound.
    pub async fn force_unlock_viewer(&self, channel_id: &str) -> Result<Option<Uuid>> {
        self.inner.force_unlock_viewer(channel_id).await
    }

    /// Best-effort snapshot of open viewer connections
    pub async fn query_state(&self) -> QueryStateResponse {
        self.inner.query_state().await
    }

    pub async fn viewer_count(&self) -> usize {
        self.inner.viewers.count().await
    }

    pub async fn list_channels(&self) -> Vec<ChannelSummary> {
        self.inner.list_channels().await
    }

    /// Close every publisher and viewer
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl<E: RtcEngine> Inner<E> {
    async fn publish(
        self: &Arc<Self>,
        channel_id: &str,
        offer: SessionDescription,
    ) -> Result<(SessionDescription, Record<E>)> {
        validate_channel_id(channel_id)?;
        require_offer(&offer)?;

        if let Some(previous) = self.channels.get(channel_id).await {
            tracing::info!(
                channel = %channel_id,
                publisher = %previous.publisher_id(),
                "Replacing previous publisher"
            );
            self.retire(&previous).await;
        }

        let connection = self
            .engine
            .create_connection()
            .await
            .map_err(|e| negotiation_error(channel_id, "create publisher connection", e))?;

        let record = Arc::new(ChannelRecord::new(channel_id, connection.clone()));

        // Two publishes raced past the teardown above; the later install wins
        if let Some(displaced) = self.channels.register_replacing(record.clone()).await {
            self.retire(&displaced).await;
        }

        self.arm_publisher(&record, &connection);

        match negotiate(connection.as_ref(), offer).await {
            Ok(answer) => {
                tracing::info!(
                    channel = %channel_id,
                    publisher = %connection.id(),
                    "Publisher negotiated"
                );
                Ok((answer, record))
            }
            Err(e) => {
                self.retire(&record).await;
                Err(negotiation_error(channel_id, "negotiate publisher", e))
            }
        }
    }

    async fn connect_viewer(
        self: &Arc<Self>,
        channel_id: &str,
        offer: SessionDescription,
    ) -> Result<(SessionDescription, Record<E>, Connection<E>)> {
        validate_channel_id(channel_id)?;
        require_offer(&offer)?;

        let record = self
            .channels
            .get(channel_id)
            .await
            .ok_or_else(|| AppError::NoSuchPublisher(channel_id.to_string()))?;

        // Claim the slot before any slow work so a concurrent connect sees it taken
        let attempt = Uuid::new_v4();
        let source = {
            let mut slots = record.lock().await;

            let source = match (&slots.publisher, &slots.media_source) {
                (Some(_), Some(source)) => source.clone(),
                _ => return Err(AppError::NoSuchPublisher(channel_id.to_string())),
            };

            if !slots.viewer.is_vacant() {
                tracing::warn!(channel = %channel_id, "Rejected viewer: slot taken");
                return Err(AppError::ViewerSlotTaken(channel_id.to_string()));
            }

            slots.viewer = ViewerSlot::Reserved(attempt);
            source
        };

        let (connection, media) = match self.provision_viewer(&source).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                self.cancel_reservation(&record, attempt).await;
                return Err(negotiation_error(channel_id, "provision viewer", e));
            }
        };

        // Tracked before binding so an unlock racing with us can always find it
        self.viewers.insert(connection.clone()).await;

        let bound = {
            let mut slots = record.lock().await;

            let reserved = matches!(slots.viewer, ViewerSlot::Reserved(id) if id == attempt);
            if reserved && slots.publisher.is_some() {
                slots.viewer = ViewerSlot::Bound {
                    connection: connection.clone(),
                    media: media.clone(),
                };
                Ok(())
            } else {
                if reserved {
                    slots.viewer = ViewerSlot::Vacant;
                }
                if slots.publisher.is_some() {
                    Err(AppError::ViewerSlotTaken(channel_id.to_string()))
                } else {
                    Err(AppError::NoSuchPublisher(channel_id.to_string()))
                }
            }
        };

        if let Err(e) = bound {
            tracing::warn!(
                channel = %channel_id,
                viewer = %connection.id(),
                "Viewer reservation revoked while provisioning"
            );
            connection.close().await;
            self.viewers.remove(connection.id()).await;
            return Err(e);
        }

        tracing::info!(channel = %channel_id, viewer = %connection.id(), "Viewer bound");

        self.arm_viewer(&record, &connection);

        let negotiated: anyhow::Result<SessionDescription> = async {
            connection.attach_outbound_media(media).await?;
            negotiate(connection.as_ref(), offer).await
        }
        .await;

        match negotiated {
            Ok(answer) => Ok((answer, record, connection)),
            Err(e) => {
                self.release_viewer(&record, &connection).await;
                Err(negotiation_error(channel_id, "negotiate viewer", e))
            }
        }
    }

    async fn provision_viewer(
        &self,
        source: &E::Source,
    ) -> anyhow::Result<(Connection<E>, E::View)> {
        let media = self.engine.subscribe(source).await?;
        let connection = self.engine.create_connection().await?;
        Ok((connection, media))
    }

    async fn cancel_reservation(&self, record: &Record<E>, attempt: Uuid) {
        let mut slots = record.lock().await;
        if matches!(slots.viewer, ViewerSlot::Reserved(id) if id == attempt) {
            slots.viewer = ViewerSlot::Vacant;
        }
    }

    async fn force_unlock_viewer(&self, channel_id: &str) -> Result<Option<Uuid>> {
        let record = self
            .channels
            .get(channel_id)
            .await
            .ok_or_else(|| AppError::NoSuchChannel(channel_id.to_string()))?;

        let evicted = record.lock().await.viewer.take();

        match evicted {
            ViewerSlot::Bound { connection, media } => {
                drop(media);
                let viewer_id = connection.id();
                tracing::info!(channel = %channel_id, viewer = %viewer_id, "Viewer force-unlocked");
                connection.close().await;
                self.viewers.remove(viewer_id).await;
                Ok(Some(viewer_id))
            }
            ViewerSlot::Reserved(_) => {
                tracing::info!(channel = %channel_id, "Revoked pending viewer reservation");
                Ok(None)
            }
            ViewerSlot::Vacant => Ok(None),
        }
    }

    async fn query_state(&self) -> QueryStateResponse {
        let mut bound: HashMap<Uuid, String> = HashMap::new();
        for record in self.channels.snapshot().await {
            if let Some(viewer_id) = record.lock().await.viewer.bound_id() {
                bound.insert(viewer_id, record.channel_id().to_string());
            }
        }

        let viewers: Vec<ViewerStateData> = self
            .viewers
            .snapshot()
            .await
            .iter()
            .map(|connection| {
                let channel_id = bound.get(&connection.id()).cloned();
                ViewerStateData {
                    id: connection.id(),
                    state: connection.connection_state(),
                    bound: channel_id.is_some(),
                    channel_id,
                }
            })
            .collect();

        QueryStateResponse {
            viewer_count: viewers.len(),
            viewers,
        }
    }

    async fn list_channels(&self) -> Vec<ChannelSummary> {
        let mut summaries = Vec::new();

        for record in self.channels.snapshot().await {
            let slots = record.lock().await;
            summaries.push(ChannelSummary {
                channel_id: record.channel_id().to_string(),
                publisher_id: record.publisher_id(),
                publisher_state: slots
                    .publisher
                    .as_ref()
                    .map_or(ConnectionState::Closed, |p| p.connection_state()),
                has_media: slots.media_source.is_some(),
                viewer_id: slots.viewer.bound_id(),
                published_at: record.published_at(),
            });
        }

        summaries.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        summaries
    }

    async fn shutdown(&self) {
        let records = self.channels.snapshot().await;
        tracing::info!(channels = records.len(), "Closing all channels");

        for record in records {
            self.retire(&record).await;
        }

        for viewer in self.viewers.snapshot().await {
            viewer.close().await;
            self.viewers.remove(viewer.id()).await;
        }
    }

    /// Tear a channel down: clear every slot, drop the registry entry if it is
    /// still this record, then close the viewer and publisher
    async fn retire(&self, record: &Record<E>) {
        let (publisher, viewer) = {
            let mut slots = record.lock().await;
            slots.media_source = None;
            (slots.publisher.take(), slots.viewer.take())
        };

        if self.channels.remove(record.channel_id(), record).await {
            tracing::info!(
                channel = %record.channel_id(),
                publisher = %record.publisher_id(),
                "Channel removed"
            );
        }

        if let ViewerSlot::Bound { connection, media } = viewer {
            drop(media);
            tracing::info!(
                channel = %record.channel_id(),
                viewer = %connection.id(),
                "Closing viewer of departed publisher"
            );
            connection.close().await;
            self.viewers.remove(connection.id()).await;
        }

        if let Some(publisher) = publisher {
            publisher.close().await;
        }
    }

    /// Free the viewer slot if `connection` still holds it, then close and
    /// untrack the connection
    async fn release_viewer(&self, record: &Record<E>, connection: &Connection<E>) {
        let released = {
            let mut slots = record.lock().await;
            if slots.viewer.bound_id() == Some(connection.id()) {
                slots.viewer = ViewerSlot::Vacant;
                true
            } else {
                false
            }
        };

        if released {
            tracing::info!(
                channel = %record.channel_id(),
                viewer = %connection.id(),
                "Viewer slot released"
            );
        }

        connection.close().await;
        self.viewers.remove(connection.id()).await;
    }

    fn arm_publisher(self: &Arc<Self>, record: &Record<E>, connection: &Connection<E>) {
        let inner = Arc::downgrade(self);
        let weak_record = Arc::downgrade(record);
        let weak_connection = Arc::downgrade(connection);

        connection.on_state_change(Arc::new(move |state: ConnectionState| {
            let inner = inner.clone();
            let record = weak_record.clone();
            let connection = weak_connection.clone();
            async move {
                if let (Some(inner), Some(connection)) = (inner.upgrade(), connection.upgrade()) {
                    inner.on_publisher_state(&record, &connection, state).await;
                }
            }
            .boxed()
        }));

        let inner = Arc::downgrade(self);
        let weak_record = Arc::downgrade(record);

        connection.on_inbound_media(Arc::new(move |event: InboundMedia<E::Source>| {
            let inner = inner.clone();
            let record = weak_record.clone();
            async move {
                if let (Some(inner), Some(record)) = (inner.upgrade(), record.upgrade()) {
                    inner.on_publisher_media(&record, event).await;
                }
            }
            .boxed()
        }));
    }

    fn arm_viewer(self: &Arc<Self>, record: &Record<E>, connection: &Connection<E>) {
        let inner = Arc::downgrade(self);
        let weak_record = Arc::downgrade(record);
        let weak_connection = Arc::downgrade(connection);

        connection.on_state_change(Arc::new(move |state: ConnectionState| {
            let inner = inner.clone();
            let record = weak_record.clone();
            let connection = weak_connection.clone();
            async move {
                if let (Some(inner), Some(connection)) = (inner.upgrade(), connection.upgrade()) {
                    inner.on_viewer_state(&record, &connection, state).await;
                }
            }
            .boxed()
        }));
    }

    async fn on_publisher_state(
        &self,
        record: &Weak<ChannelRecord<E>>,
        connection: &Connection<E>,
        state: ConnectionState,
    ) {
        tracing::info!(publisher = %connection.id(), state = %state, "Publisher connection state changed");

        if !state.is_terminal() {
            return;
        }

        if let Some(record) = record.upgrade() {
            self.retire(&record).await;
        }
        connection.close().await;
    }

    async fn on_publisher_media(&self, record: &Record<E>, event: InboundMedia<E::Source>) {
        match event {
            InboundMedia::Started(source) => {
                let mut slots = record.lock().await;
                if slots.publisher.is_none() {
                    tracing::debug!(channel = %record.channel_id(), "Ignoring media for retired publisher");
                    return;
                }

                tracing::info!(
                    channel = %record.channel_id(),
                    source = %source.source_id(),
                    "Publisher media arrived"
                );
                slots.media_source = Some(source);
            }
            InboundMedia::Ended(source_id) => {
                // A viewer cannot outlive the media it was bound to
                let evicted = {
                    let mut slots = record.lock().await;
                    let current = slots
                        .media_source
                        .as_ref()
                        .is_some_and(|source| source.source_id() == source_id);
                    if !current {
                        return;
                    }
                    slots.media_source = None;
                    slots.viewer.take()
                };

                tracing::info!(channel = %record.channel_id(), source = %source_id, "Publisher media ended");

                if let ViewerSlot::Bound { connection, media } = evicted {
                    drop(media);
                    connection.close().await;
                    self.viewers.remove(connection.id()).await;
                }
            }
        }
    }

    async fn on_viewer_state(
        &self,
        record: &Weak<ChannelRecord<E>>,
        connection: &Connection<E>,
        state: ConnectionState,
    ) {
        tracing::info!(viewer = %connection.id(), state = %state, "Viewer connection state changed");

        if !state.is_terminal() {
            return;
        }

        match record.upgrade() {
            Some(record) => self.release_viewer(&record, connection).await,
            None => {
                connection.close().await;
                self.viewers.remove(connection.id()).await;
            }
        }
    }
}

fn validate_channel_id(channel_id: &str) -> Result<()> {
    if channel_id.trim().is_empty() {
        return Err(AppError::BadRequest("channel id must not be empty".to_string()));
    }
    Ok(())
}

fn require_offer(description: &SessionDescription) -> Result<()> {
    if description.sdp_type != SdpType::Offer {
        return Err(AppError::Negotiation(format!(
            "expected an SDP offer, got {}",
            description.sdp_type
        )));
    }
    Ok(())
}

fn abandoned_task(operation: &str) -> AppError {
    AppError::Internal(anyhow::anyhow!("{operation} task ended without a reply"))
}

fn negotiation_error(channel_id: &str, step: &str, error: anyhow::Error) -> AppError {
    tracing::warn!(channel = %channel_id, error = %error, "Failed to {}", step);
    AppError::Negotiation(format!("{step}: {error:#}"))
}
