//! Persistence for channel bindings, processed-message records, provider
//! settings, and the discovery cache.
//!
//! The engine talks to storage through the [`Store`] trait. Production
//! deployments use [`PgStore`] (feature `postgres`); tests and single-
//! process development use [`MemoryStore`]. The binding store and the
//! processed-message records are the only mutable state shared across
//! processes, so both implementations keep upsert and mark-processed
//! atomic.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::config::ProviderSettings;
use crate::error::StoreError;
use crate::providers::ChatProvider;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

/// Persisted mapping of a chat channel to the agent handling it.
///
/// Unique per (provider, channel_id, workspace_id). Created agent-less
/// on first contact; the agent is assigned later via slash command,
/// interactive selection, or the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider: ChatProvider,
    pub channel_id: String,
    pub workspace_id: String,
    pub workspace_name: Option<String>,
    pub channel_name: Option<String>,
    pub is_dm: bool,
    pub dm_owner_email: Option<String>,
    pub agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating or refreshing a binding. `upsert_binding` never
/// touches an existing row's agent assignment.
#[derive(Debug, Clone)]
pub struct NewChannelBinding {
    pub organization_id: Uuid,
    pub provider: ChatProvider,
    pub channel_id: String,
    pub workspace_id: String,
    pub workspace_name: Option<String>,
    pub channel_name: Option<String>,
    pub is_dm: bool,
    pub dm_owner_email: Option<String>,
}

/// Storage operations the engine needs. All mutating operations are
/// safe under concurrent callers.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Channel bindings ---

    async fn get_binding(&self, id: Uuid) -> Result<Option<ChannelBinding>, StoreError>;

    async fn find_binding(
        &self,
        provider: ChatProvider,
        channel_id: &str,
        workspace_id: &str,
    ) -> Result<Option<ChannelBinding>, StoreError>;

    /// Insert the binding if absent; otherwise refresh its display
    /// names (only with values that are present). Returns the stored
    /// row either way.
    async fn upsert_binding(
        &self,
        binding: NewChannelBinding,
    ) -> Result<ChannelBinding, StoreError>;

    /// Assign or clear the bound agent.
    async fn set_binding_agent(
        &self,
        id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<ChannelBinding, StoreError>;

    async fn delete_binding(&self, id: Uuid) -> Result<(), StoreError>;

    async fn list_bindings(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<ChannelBinding>, StoreError>;

    /// Every binding for a provider, across all workspace-id variants.
    /// Reconciliation works from this set.
    async fn bindings_for_provider(
        &self,
        provider: ChatProvider,
    ) -> Result<Vec<ChannelBinding>, StoreError>;

    // --- Processed-message records (durable idempotency tier) ---

    /// Atomically record a message id as processed. Returns `true` when
    /// this call inserted the record (the caller won the race), `false`
    /// when it already existed.
    async fn mark_processed(
        &self,
        provider: ChatProvider,
        message_id: &str,
    ) -> Result<bool, StoreError>;

    /// Drop processed-message records older than the cutoff. Returns the
    /// number removed.
    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // --- Provider settings ---

    async fn load_provider_settings(
        &self,
        provider: ChatProvider,
    ) -> Result<Option<ProviderSettings>, StoreError>;

    async fn save_provider_settings(
        &self,
        settings: &ProviderSettings,
    ) -> Result<(), StoreError>;

    // --- Discovery cache (distributed TTL guard) ---

    /// Whether a discovery pass for (provider, workspace) ran within
    /// `ttl`.
    async fn discovery_fresh(
        &self,
        provider: ChatProvider,
        workspace_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Record a completed discovery pass for (provider, workspace).
    async fn mark_discovery_fresh(
        &self,
        provider: ChatProvider,
        workspace_id: &str,
    ) -> Result<(), StoreError>;
}
