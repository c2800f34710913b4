//! Channel registry
//!
//! Maps a channel id to its [`ChannelRecord`]. The registry lock is held only
//! for map operations; callers take a record's own lock afterwards, never
//! while holding the registry's.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::rtc::{PeerConnection, RtcEngine};

/// State of a channel's single viewer slot
pub enum ViewerSlot<E: RtcEngine> {
    Vacant,
    /// Claimed by an in-flight viewer connect that is still provisioning
    Reserved(Uuid),
    Bound {
        connection: Arc<E::Connection>,
        media: E::View,
    },
}

impl<E: RtcEngine> ViewerSlot<E> {
    pub fn is_vacant(&self) -> bool {
        matches!(self, ViewerSlot::Vacant)
    }

    /// Id of the bound viewer connection, if any
    pub fn bound_id(&self) -> Option<Uuid> {
        match self {
            ViewerSlot::Bound { connection, .. } => Some(connection.id()),
            _ => None,
        }
    }

    pub fn take(&mut self) -> ViewerSlot<E> {
        std::mem::replace(self, ViewerSlot::Vacant)
    }
}

/// Mutable per-channel state, only reachable through the record lock
pub struct ChannelSlots<E: RtcEngine> {
    pub publisher: Option<Arc<E::Connection>>,
    pub media_source: Option<E::Source>,
    pub viewer: ViewerSlot<E>,
}

/// One publisher and at most one viewer
pub struct ChannelRecord<E: RtcEngine> {
    channel_id: String,
    publisher_id: Uuid,
    published_at: DateTime<Utc>,
    slots: Mutex<ChannelSlots<E>>,
}

impl<E: RtcEngine> ChannelRecord<E> {
    pub fn new(channel_id: impl Into<String>, publisher: Arc<E::Connection>) -> Self {
        Self {
            channel_id: channel_id.into(),
            publisher_id: publisher.id(),
            published_at: Utc::now(),
            slots: Mutex::new(ChannelSlots {
                publisher: Some(publisher),
                media_source: None,
                viewer: ViewerSlot::Vacant,
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Connection id of the publisher this record was created for
    pub fn publisher_id(&self) -> Uuid {
        self.publisher_id
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// Acquire the record lock
    pub async fn lock(&self) -> MutexGuard<'_, ChannelSlots<E>> {
        self.slots.lock().await
    }
}

pub struct ChannelRegistry<E: RtcEngine> {
    channels: RwLock<HashMap<String, Arc<ChannelRecord<E>>>>,
}

impl<E: RtcEngine> ChannelRegistry<E> {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a record. The caller must still lock it before mutating.
    pub async fn get(&self, channel_id: &str) -> Option<Arc<ChannelRecord<E>>> {
        self.channels.read().await.get(channel_id).cloned()
    }

    /// Install `record`, returning whatever it displaced for the caller to
    /// tear down outside the registry lock
    pub async fn register_replacing(
        &self,
        record: Arc<ChannelRecord<E>>,
    ) -> Option<Arc<ChannelRecord<E>>> {
        let displaced = self
            .channels
            .write()
            .await
            .insert(record.channel_id().to_string(), record.clone());

        tracing::debug!(
            channel = %record.channel_id(),
            publisher = %record.publisher_id(),
            replaced = displaced.is_some(),
            "Registered channel"
        );

        displaced
    }

    /// Remove the mapping only if it still points at `expected`
    pub async fn remove(&self, channel_id: &str, expected: &Arc<ChannelRecord<E>>) -> bool {
        let mut channels = self.channels.write().await;

        match channels.get(channel_id) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                channels.remove(channel_id);
                true
            }
            _ => false,
        }
    }

    /// Point-in-time list of every record
    pub async fn snapshot(&self) -> Vec<Arc<ChannelRecord<E>>> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }
}

impl<E: RtcEngine> Default for ChannelRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::LoopbackEngine;

    async fn record(engine: &LoopbackEngine, channel_id: &str) -> Arc<ChannelRecord<LoopbackEngine>> {
        let connection = engine.create_connection().await.unwrap();
        Arc::new(ChannelRecord::new(channel_id, connection))
    }

    #[tokio::test]
    async fn test_register_replacing_returns_previous() {
        let engine = LoopbackEngine::new();
        let registry = ChannelRegistry::new();
        let first = record(&engine, "cam01").await;
        let second = record(&engine, "cam01").await;

        assert!(registry.register_replacing(first.clone()).await.is_none());

        let displaced = registry.register_replacing(second.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&displaced, &first));

        let current = registry.get("cam01").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_ignores_stale_record() {
        let engine = LoopbackEngine::new();
        let registry = ChannelRegistry::new();
        let stale = record(&engine, "cam01").await;
        let fresh = record(&engine, "cam01").await;

        registry.register_replacing(stale.clone()).await;
        registry.register_replacing(fresh.clone()).await;

        // A late cleanup for the old publisher must not evict the new one
        assert!(!registry.remove("cam01", &stale).await);
        assert!(registry.get("cam01").await.is_some());

        assert!(registry.remove("cam01", &fresh).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_new_record_starts_without_media_or_viewer() {
        let engine = LoopbackEngine::new();
        let record = record(&engine, "cam01").await;

        let slots = record.lock().await;
        assert!(slots.publisher.is_some());
        assert!(slots.media_source.is_none());
        assert!(slots.viewer.is_vacant());
        assert_eq!(slots.viewer.bound_id(), None);
    }
}
