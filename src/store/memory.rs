//! In-memory store for tests and single-process development.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ProviderSettings;
use crate::error::StoreError;
use crate::providers::ChatProvider;

use super::{ChannelBinding, NewChannelBinding, Store};

/// All tables behind one process-local lock set. Mutations take the
/// write lock for their whole operation, which is what makes
/// `mark_processed` and `upsert_binding` atomic here.
#[derive(Default)]
pub struct MemoryStore {
    bindings: RwLock<HashMap<Uuid, ChannelBinding>>,
    processed: RwLock<HashMap<String, DateTime<Utc>>>,
    settings: RwLock<HashMap<ChatProvider, ProviderSettings>>,
    discovery: RwLock<HashMap<String, Instant>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn processed_key(provider: ChatProvider, message_id: &str) -> String {
        format!("{provider}:{message_id}")
    }

    fn discovery_key(provider: ChatProvider, workspace_id: &str) -> String {
        format!("{provider}:{workspace_id}")
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_binding(&self, id: Uuid) -> Result<Option<ChannelBinding>, StoreError> {
        Ok(self.bindings.read().await.get(&id).cloned())
    }

    async fn find_binding(
        &self,
        provider: ChatProvider,
        channel_id: &str,
        workspace_id: &str,
    ) -> Result<Option<ChannelBinding>, StoreError> {
        Ok(self
            .bindings
            .read()
            .await
            .values()
            .find(|b| {
                b.provider == provider
                    && b.channel_id == channel_id
                    && b.workspace_id == workspace_id
            })
            .cloned())
    }

    async fn upsert_binding(
        &self,
        binding: NewChannelBinding,
    ) -> Result<ChannelBinding, StoreError> {
        let mut bindings = self.bindings.write().await;

        if let Some(existing) = bindings.values_mut().find(|b| {
            b.provider == binding.provider
                && b.channel_id == binding.channel_id
                && b.workspace_id == binding.workspace_id
        }) {
            if binding.workspace_name.is_some() {
                existing.workspace_name = binding.workspace_name;
            }
            if binding.channel_name.is_some() {
                existing.channel_name = binding.channel_name;
            }
            if binding.dm_owner_email.is_some() {
                existing.dm_owner_email = binding.dm_owner_email;
            }
            existing.is_dm = binding.is_dm;
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let row = ChannelBinding {
            id: Uuid::new_v4(),
            organization_id: binding.organization_id,
            provider: binding.provider,
            channel_id: binding.channel_id,
            workspace_id: binding.workspace_id,
            workspace_name: binding.workspace_name,
            channel_name: binding.channel_name,
            is_dm: binding.is_dm,
            dm_owner_email: binding.dm_owner_email,
            agent_id: None,
            created_at: now,
            updated_at: now,
        };
        bindings.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_binding_agent(
        &self,
        id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<ChannelBinding, StoreError> {
        let mut bindings = self.bindings.write().await;
        let row = bindings
            .get_mut(&id)
            .ok_or(StoreError::BindingNotFound { id })?;
        row.agent_id = agent_id;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn delete_binding(&self, id: Uuid) -> Result<(), StoreError> {
        self.bindings.write().await.remove(&id);
        Ok(())
    }

    async fn list_bindings(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<ChannelBinding>, StoreError> {
        let mut rows: Vec<ChannelBinding> = self
            .bindings
            .read()
            .await
            .values()
            .filter(|b| b.organization_id == organization_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn bindings_for_provider(
        &self,
        provider: ChatProvider,
    ) -> Result<Vec<ChannelBinding>, StoreError> {
        let mut rows: Vec<ChannelBinding> = self
            .bindings
            .read()
            .await
            .values()
            .filter(|b| b.provider == provider)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn mark_processed(
        &self,
        provider: ChatProvider,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let key = Self::processed_key(provider, message_id);
        let mut processed = self.processed.write().await;
        match processed.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(false),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Ok(true)
            }
        }
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut processed = self.processed.write().await;
        let before = processed.len();
        processed.retain(|_, at| *at >= cutoff);
        Ok((before - processed.len()) as u64)
    }

    async fn load_provider_settings(
        &self,
        provider: ChatProvider,
    ) -> Result<Option<ProviderSettings>, StoreError> {
        Ok(self.settings.read().await.get(&provider).cloned())
    }

    async fn save_provider_settings(
        &self,
        settings: &ProviderSettings,
    ) -> Result<(), StoreError> {
        self.settings
            .write()
            .await
            .insert(settings.provider(), settings.clone());
        Ok(())
    }

    async fn discovery_fresh(
        &self,
        provider: ChatProvider,
        workspace_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let key = Self::discovery_key(provider, workspace_id);
        Ok(self
            .discovery
            .read()
            .await
            .get(&key)
            .is_some_and(|at| at.elapsed() < ttl))
    }

    async fn mark_discovery_fresh(
        &self,
        provider: ChatProvider,
        workspace_id: &str,
    ) -> Result<(), StoreError> {
        let key = Self::discovery_key(provider, workspace_id);
        self.discovery.write().await.insert(key, Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_binding(channel: &str, workspace: &str) -> NewChannelBinding {
        NewChannelBinding {
            organization_id: Uuid::new_v4(),
            provider: ChatProvider::Slack,
            channel_id: channel.to_string(),
            workspace_id: workspace.to_string(),
            workspace_name: None,
            channel_name: None,
            is_dm: false,
            dm_owner_email: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_agentless_binding() {
        let store = MemoryStore::new();
        let row = store.upsert_binding(new_binding("C1", "T1")).await.unwrap();
        assert!(row.agent_id.is_none());
        let found = store
            .find_binding(ChatProvider::Slack, "C1", "T1")
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, row.id);
    }

    #[tokio::test]
    async fn test_upsert_refreshes_names_without_touching_agent() {
        let store = MemoryStore::new();
        let row = store.upsert_binding(new_binding("C1", "T1")).await.unwrap();
        let agent = Uuid::new_v4();
        store.set_binding_agent(row.id, Some(agent)).await.unwrap();

        let mut refresh = new_binding("C1", "T1");
        refresh.channel_name = Some("#sales".to_string());
        let updated = store.upsert_binding(refresh).await.unwrap();

        assert_eq!(updated.id, row.id);
        assert_eq!(updated.channel_name.as_deref(), Some("#sales"));
        assert_eq!(updated.agent_id, Some(agent));
    }

    #[tokio::test]
    async fn test_upsert_does_not_clear_names_with_none() {
        let store = MemoryStore::new();
        let mut first = new_binding("C1", "T1");
        first.channel_name = Some("#ops".to_string());
        store.upsert_binding(first).await.unwrap();

        let updated = store.upsert_binding(new_binding("C1", "T1")).await.unwrap();
        assert_eq!(updated.channel_name.as_deref(), Some("#ops"));
    }

    #[tokio::test]
    async fn test_find_is_scoped_by_workspace() {
        let store = MemoryStore::new();
        store.upsert_binding(new_binding("C1", "T1")).await.unwrap();
        let miss = store
            .find_binding(ChatProvider::Slack, "C1", "T2")
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_set_agent_on_missing_binding_errors() {
        let store = MemoryStore::new();
        let err = store
            .set_binding_agent(Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BindingNotFound { .. }));
    }

    #[tokio::test]
    async fn test_mark_processed_exactly_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .mark_processed(ChatProvider::Slack, "C1:1700000000.1")
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_mark_processed_scoped_by_provider() {
        let store = MemoryStore::new();
        assert!(store.mark_processed(ChatProvider::Slack, "m1").await.unwrap());
        assert!(store.mark_processed(ChatProvider::Teams, "m1").await.unwrap());
        assert!(!store.mark_processed(ChatProvider::Slack, "m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_processed_before() {
        let store = MemoryStore::new();
        store.mark_processed(ChatProvider::Slack, "old").await.unwrap();
        let purged = store
            .purge_processed_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        // The id is gone, so marking again wins again.
        assert!(store.mark_processed(ChatProvider::Slack, "old").await.unwrap());
    }

    #[tokio::test]
    async fn test_discovery_cache_freshness() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(!store
            .discovery_fresh(ChatProvider::Slack, "T1", ttl)
            .await
            .unwrap());
        store
            .mark_discovery_fresh(ChatProvider::Slack, "T1")
            .await
            .unwrap();
        assert!(store
            .discovery_fresh(ChatProvider::Slack, "T1", ttl)
            .await
            .unwrap());
        // A different workspace is still stale.
        assert!(!store
            .discovery_fresh(ChatProvider::Slack, "T2", ttl)
            .await
            .unwrap());
    }
}
