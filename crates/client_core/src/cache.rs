use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{ChatMessage, RoomId};
use storage::MessageCache;

use crate::CacheStore;

/// Cache store backed by the on-disk sqlite message cache.
pub struct DurableMessageCache {
    store: MessageCache,
}

impl DurableMessageCache {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = MessageCache::new(database_url)
            .await
            .with_context(|| format!("failed to initialize message cache at '{database_url}'"))?;
        Ok(Arc::new(Self { store }))
    }
}

#[async_trait]
impl CacheStore for DurableMessageCache {
    async fn load(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        self.store.load_messages(room_id).await
    }

    async fn upsert(&self, message: &ChatMessage) -> Result<()> {
        self.store.upsert_message(message).await
    }
}
