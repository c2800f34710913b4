use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::rtc::PeerConnection;

/// Every open viewer connection across all channels
///
/// Introspection only: the channel record's viewer slot is what enforces the
/// one-viewer limit.
pub struct ViewerRegistry<C: PeerConnection> {
    viewers: RwLock<HashMap<Uuid, Arc<C>>>,
}

impl<C: PeerConnection> ViewerRegistry<C> {
    pub fn new() -> Self {
        Self {
            viewers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, connection: Arc<C>) {
        let id = connection.id();
        self.viewers.write().await.insert(id, connection);
        tracing::debug!(connection = %id, "Viewer connection tracked");
    }

    /// Returns false if the connection was already gone
    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.viewers.write().await.remove(&id).is_some();
        if removed {
            tracing::debug!(connection = %id, "Viewer connection untracked");
        }
        removed
    }

    pub async fn snapshot(&self) -> Vec<Arc<C>> {
        self.viewers.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.viewers.read().await.len()
    }
}

impl<C: PeerConnection> Default for ViewerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::{LoopbackEngine, RtcEngine};

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let engine = LoopbackEngine::new();
        let registry = ViewerRegistry::new();
        let connection = engine.create_connection().await.unwrap();
        let id = connection.id();

        registry.insert(connection).await;
        assert_eq!(registry.count().await, 1);

        assert!(registry.remove(id).await);
        assert!(!registry.remove(id).await);
        assert_eq!(registry.count().await, 0);
    }
}
