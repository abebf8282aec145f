//! PostgreSQL-backed store.
//!
//! Atomicity notes: `mark_processed` relies on `INSERT .. ON CONFLICT DO
//! NOTHING` so concurrent processes racing on one message id get exactly
//! one inserted row; `upsert_binding` uses the same mechanism against
//! the (provider, channel_id, workspace_id) unique index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::config::ProviderSettings;
use crate::error::StoreError;
use crate::providers::ChatProvider;

use super::{ChannelBinding, NewChannelBinding, Store};

mod migrations {
    refinery::embed_migrations!("migrations");
}

/// Store backed by a deadpool PostgreSQL pool.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Wrap an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from a connection URL.
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let cfg = Config {
            url: Some(database_url.to_string()),
            ..Config::default()
        };
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        migrations::migrations::runner()
            .run_async(&mut **conn)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, StoreError> {
        Ok(self.pool.get().await?)
    }

    fn row_to_binding(row: &Row) -> Result<ChannelBinding, StoreError> {
        let provider: String = row.get("provider");
        let provider: ChatProvider = provider
            .parse()
            .map_err(|_| StoreError::Serialization(format!("unknown provider '{provider}'")))?;
        Ok(ChannelBinding {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            provider,
            channel_id: row.get("channel_id"),
            workspace_id: row.get("workspace_id"),
            workspace_name: row.get("workspace_name"),
            channel_name: row.get("channel_name"),
            is_dm: row.get("is_dm"),
            dm_owner_email: row.get("dm_owner_email"),
            agent_id: row.get("agent_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

const BINDING_COLUMNS: &str = "id, organization_id, provider, channel_id, workspace_id, \
     workspace_name, channel_name, is_dm, dm_owner_email, agent_id, created_at, updated_at";

#[async_trait]
impl Store for PgStore {
    async fn get_binding(&self, id: Uuid) -> Result<Option<ChannelBinding>, StoreError> {
        let conn = self.conn().await?;
        let stmt = format!("SELECT {BINDING_COLUMNS} FROM channel_bindings WHERE id = $1");
        let row = conn.query_opt(stmt.as_str(), &[&id]).await?;
        row.as_ref().map(Self::row_to_binding).transpose()
    }

    async fn find_binding(
        &self,
        provider: ChatProvider,
        channel_id: &str,
        workspace_id: &str,
    ) -> Result<Option<ChannelBinding>, StoreError> {
        let conn = self.conn().await?;
        let stmt = format!(
            "SELECT {BINDING_COLUMNS} FROM channel_bindings \
             WHERE provider = $1 AND channel_id = $2 AND workspace_id = $3"
        );
        let row = conn
            .query_opt(stmt.as_str(), &[&provider.as_str(), &channel_id, &workspace_id])
            .await?;
        row.as_ref().map(Self::row_to_binding).transpose()
    }

    async fn upsert_binding(
        &self,
        binding: NewChannelBinding,
    ) -> Result<ChannelBinding, StoreError> {
        let conn = self.conn().await?;
        let stmt = format!(
            r#"
            INSERT INTO channel_bindings (
                id, organization_id, provider, channel_id, workspace_id,
                workspace_name, channel_name, is_dm, dm_owner_email,
                agent_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, now(), now())
            ON CONFLICT (provider, channel_id, workspace_id) DO UPDATE SET
                workspace_name = COALESCE(EXCLUDED.workspace_name, channel_bindings.workspace_name),
                channel_name = COALESCE(EXCLUDED.channel_name, channel_bindings.channel_name),
                dm_owner_email = COALESCE(EXCLUDED.dm_owner_email, channel_bindings.dm_owner_email),
                is_dm = EXCLUDED.is_dm,
                updated_at = now()
            RETURNING {BINDING_COLUMNS}
            "#
        );
        let row = conn
            .query_one(
                stmt.as_str(),
                &[
                    &Uuid::new_v4(),
                    &binding.organization_id,
                    &binding.provider.as_str(),
                    &binding.channel_id,
                    &binding.workspace_id,
                    &binding.workspace_name,
                    &binding.channel_name,
                    &binding.is_dm,
                    &binding.dm_owner_email,
                ],
            )
            .await?;
        Self::row_to_binding(&row)
    }

    async fn set_binding_agent(
        &self,
        id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<ChannelBinding, StoreError> {
        let conn = self.conn().await?;
        let stmt = format!(
            "UPDATE channel_bindings SET agent_id = $2, updated_at = now() \
             WHERE id = $1 RETURNING {BINDING_COLUMNS}"
        );
        let row = conn.query_opt(stmt.as_str(), &[&id, &agent_id]).await?;
        match row {
            Some(row) => Self::row_to_binding(&row),
            None => Err(StoreError::BindingNotFound { id }),
        }
    }

    async fn delete_binding(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM channel_bindings WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    async fn list_bindings(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<ChannelBinding>, StoreError> {
        let conn = self.conn().await?;
        let stmt = format!(
            "SELECT {BINDING_COLUMNS} FROM channel_bindings \
             WHERE organization_id = $1 ORDER BY created_at"
        );
        let rows = conn.query(stmt.as_str(), &[&organization_id]).await?;
        rows.iter().map(Self::row_to_binding).collect()
    }

    async fn bindings_for_provider(
        &self,
        provider: ChatProvider,
    ) -> Result<Vec<ChannelBinding>, StoreError> {
        let conn = self.conn().await?;
        let stmt = format!(
            "SELECT {BINDING_COLUMNS} FROM channel_bindings \
             WHERE provider = $1 ORDER BY created_at"
        );
        let rows = conn.query(stmt.as_str(), &[&provider.as_str()]).await?;
        rows.iter().map(Self::row_to_binding).collect()
    }

    async fn mark_processed(
        &self,
        provider: ChatProvider,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                "INSERT INTO processed_messages (provider, message_id, processed_at) \
                 VALUES ($1, $2, now()) ON CONFLICT DO NOTHING",
                &[&provider.as_str(), &message_id],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn().await?;
        let removed = conn
            .execute(
                "DELETE FROM processed_messages WHERE processed_at < $1",
                &[&cutoff],
            )
            .await?;
        Ok(removed)
    }

    async fn load_provider_settings(
        &self,
        provider: ChatProvider,
    ) -> Result<Option<ProviderSettings>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT settings FROM provider_settings WHERE provider = $1",
                &[&provider.as_str()],
            )
            .await?;
        match row {
            Some(row) => {
                let value: serde_json::Value = row.get("settings");
                serde_json::from_value(value)
                    .map(Some)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn save_provider_settings(
        &self,
        settings: &ProviderSettings,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(settings)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO provider_settings (provider, settings, updated_at) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (provider) DO UPDATE SET settings = EXCLUDED.settings, updated_at = now()",
            &[&settings.provider().as_str(), &value],
        )
        .await?;
        Ok(())
    }

    async fn discovery_fresh(
        &self,
        provider: ChatProvider,
        workspace_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Query(format!("ttl out of range: {e}")))?;
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT 1 FROM discovery_cache \
                 WHERE provider = $1 AND workspace_id = $2 AND refreshed_at > $3",
                &[&provider.as_str(), &workspace_id, &cutoff],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn mark_discovery_fresh(
        &self,
        provider: ChatProvider,
        workspace_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO discovery_cache (provider, workspace_id, refreshed_at) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (provider, workspace_id) DO UPDATE SET refreshed_at = now()",
            &[&provider.as_str(), &workspace_id],
        )
        .await?;
        Ok(())
    }
}
