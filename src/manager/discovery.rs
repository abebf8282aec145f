//! Channel discovery and binding reconciliation.
//!
//! Discovery lists a provider's live channels and reconciles stored
//! bindings against them: new channels gain agent-less bindings,
//! existing ones get their display names refreshed, vanished ones are
//! deleted across every workspace-id format the platform uses, and
//! duplicate rows recorded under different formats are collapsed.
//!
//! A shared TTL cache keyed by (provider, workspace) keeps this from
//! running on every message; the pass is safe to run concurrently with
//! message processing because the triggering message's exact
//! (channel, workspace) pair is never deleted in the same pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{PipelineError, ProviderError};
use crate::providers::ChatProvider;
use crate::store::{ChannelBinding, NewChannelBinding};

use super::ChatOpsManager;

/// What one discovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DiscoveryReport {
    /// The TTL cache was fresh; nothing was listed.
    pub skipped: bool,
    /// Live channels upserted (created or name-refreshed).
    pub upserted: usize,
    /// Bindings removed because their channel left the live list.
    pub removed: usize,
    /// Duplicate-format bindings collapsed.
    pub collapsed: usize,
}

impl DiscoveryReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

impl ChatOpsManager {
    /// Fire-and-forget discovery trigger. The spawned task owns its
    /// errors; the request path never waits on it.
    pub fn spawn_discovery(
        self: &Arc<Self>,
        provider: ChatProvider,
        workspace_id: String,
        extra_workspace_ids: Vec<String>,
        protect: Option<(String, String)>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let protect_ref = protect
                .as_ref()
                .map(|(channel, workspace)| (channel.as_str(), workspace.as_str()));
            match manager
                .discover_channels(provider, &workspace_id, &extra_workspace_ids, protect_ref)
                .await
            {
                Ok(report) if report.skipped => {}
                Ok(report) => tracing::info!(
                    %provider,
                    workspace_id,
                    upserted = report.upserted,
                    removed = report.removed,
                    collapsed = report.collapsed,
                    "channel discovery reconciled"
                ),
                Err(e) => {
                    tracing::warn!(%provider, workspace_id, error = %e, "channel discovery failed");
                }
            }
        });
    }

    /// Run one discovery pass for (provider, workspace), unless the TTL
    /// cache says a recent pass already covered it.
    ///
    /// `extra_workspace_ids` are additional id formats the same
    /// workspace is known under (platforms can expose both a stable
    /// group id and a transient thread-style id); vanished channels are
    /// cleaned across all of them. `protect` is the currently-processing
    /// message's (channel_id, workspace_id) pair, which this pass must
    /// never delete.
    pub async fn discover_channels(
        &self,
        provider: ChatProvider,
        workspace_id: &str,
        extra_workspace_ids: &[String],
        protect: Option<(&str, &str)>,
    ) -> Result<DiscoveryReport, PipelineError> {
        if self
            .store()
            .discovery_fresh(provider, workspace_id, self.discovery_ttl())
            .await?
        {
            return Ok(DiscoveryReport::skipped());
        }
        self.run_discovery(provider, workspace_id, extra_workspace_ids, protect)
            .await
    }

    /// Admin-triggered refresh: run a pass regardless of the TTL cache.
    pub async fn refresh_discovery(
        &self,
        provider: ChatProvider,
        workspace_id: &str,
    ) -> Result<DiscoveryReport, PipelineError> {
        self.run_discovery(provider, workspace_id, &[], None).await
    }

    async fn run_discovery(
        &self,
        provider: ChatProvider,
        workspace_id: &str,
        extra_workspace_ids: &[String],
        protect: Option<(&str, &str)>,
    ) -> Result<DiscoveryReport, PipelineError> {
        let adapter = self
            .adapter(provider)
            .await
            .ok_or(PipelineError::Provider(ProviderError::NotConfigured { provider }))?;
        let organization_id = self
            .provider_organization(provider)
            .await?
            .ok_or_else(|| PipelineError::Lookup(format!("no settings row for {provider}")))?;

        let live = adapter.discover_channels(workspace_id).await?;
        let mut report = DiscoveryReport::default();

        for channel in &live {
            self.store()
                .upsert_binding(NewChannelBinding {
                    organization_id,
                    provider,
                    channel_id: channel.channel_id.clone(),
                    workspace_id: channel.workspace_id.clone(),
                    workspace_name: channel.workspace_name.clone(),
                    channel_name: channel.channel_name.clone(),
                    is_dm: channel.is_dm,
                    dm_owner_email: channel.dm_owner_email.clone(),
                })
                .await?;
            report.upserted += 1;
        }

        // Every id format this workspace is known under.
        let mut variants: HashSet<String> = HashSet::new();
        variants.insert(workspace_id.to_string());
        variants.extend(extra_workspace_ids.iter().cloned());

        let live_ids: HashSet<&str> = live.iter().map(|c| c.channel_id.as_str()).collect();
        let is_protected = |binding: &ChannelBinding| {
            protect.is_some_and(|(channel, workspace)| {
                binding.channel_id == channel && binding.workspace_id == workspace
            })
        };

        for binding in self.store().bindings_for_provider(provider).await? {
            if !variants.contains(&binding.workspace_id) {
                continue;
            }
            if live_ids.contains(binding.channel_id.as_str()) {
                continue;
            }
            if is_protected(&binding) {
                continue;
            }
            self.store().delete_binding(binding.id).await?;
            report.removed += 1;
        }

        // Collapse one channel recorded under two workspace-id formats.
        let mut by_channel: HashMap<String, Vec<ChannelBinding>> = HashMap::new();
        for binding in self.store().bindings_for_provider(provider).await? {
            if variants.contains(&binding.workspace_id) {
                by_channel
                    .entry(binding.channel_id.clone())
                    .or_default()
                    .push(binding);
            }
        }
        for (_, mut rows) in by_channel {
            if rows.len() < 2 {
                continue;
            }
            // The agent-bearing row wins; ties go to the oldest.
            rows.sort_by(|a, b| {
                b.agent_id
                    .is_some()
                    .cmp(&a.agent_id.is_some())
                    .then(a.created_at.cmp(&b.created_at))
            });
            for duplicate in rows.into_iter().skip(1) {
                if is_protected(&duplicate) {
                    continue;
                }
                self.store().delete_binding(duplicate.id).await?;
                report.collapsed += 1;
            }
        }

        self.store()
            .mark_discovery_fresh(provider, workspace_id)
            .await?;
        Ok(report)
    }
}
