//! ChatOps manager: the message-processing and channel-discovery
//! pipelines.
//!
//! The manager owns the provider adapters (constructed at startup,
//! swapped atomically on reconfiguration), the two dedup tiers, and the
//! orchestration from inbound message to agent execution and reply:
//!
//! ```text
//! RECEIVED -> deduped | no binding | no agent
//!          -> inline override -> security check -> context
//!          -> execute -> reply (footer)
//! ```
//!
//! Nothing in here assumes a particular platform; adapters hide the
//! protocol, the store hides persistence, and the backend traits hide
//! the rest of the product.

mod discovery;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{AgentDirectory, AgentExecutor, AgentRecord, ExecutionRequest, UserDirectory, UserRecord};
use crate::config::{ConnectionMode, ProviderSettings, seed_from_env};
use crate::dedup::DedupCache;
use crate::error::{Error, PipelineError, ProviderError};
use crate::matcher;
use crate::providers::{
    ChatProvider, IncomingMessage, PLACEHOLDER_METADATA_KEY, ProviderAdapter, ReplyOptions,
    SlackAdapter, TeamsAdapter, ThreadHistoryQuery, ThreadMessage, strip_footer,
};
use crate::store::{ChannelBinding, NewChannelBinding, Store};

pub use discovery::DiscoveryReport;

/// How long discovery results are considered fresh.
const DEFAULT_DISCOVERY_TTL: Duration = Duration::from_secs(15 * 60);

/// How long processed-message records are retained.
const DEFAULT_PROCESSED_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Messages of thread history fed back as context.
const THREAD_HISTORY_LIMIT: usize = 20;

/// Why a message was refused before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// No email address could be resolved for the sender.
    IdentityUnverified,
    /// The email does not belong to a registered user.
    UnknownUser { email: String },
    /// The user may not run the effective agent.
    AccessDenied { agent_name: String },
}

/// Structured result of one `process_message` call.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The message id was already processed; idempotent no-op.
    Duplicate,
    /// No binding exists for the channel yet.
    NoBinding,
    /// The binding exists but no agent has been assigned.
    NoAgentAssigned,
    /// The bound agent no longer resolves to an internal agent.
    AgentNotFound,
    /// The security check refused the sender.
    Denied(DenialReason),
    /// The executor call failed; an apology was sent.
    ExecutionFailed { message_id: String },
    /// The agent answered and the reply was delivered.
    Replied {
        agent_id: Uuid,
        response: String,
        interaction_id: Uuid,
    },
    /// The agent returned empty text.
    NoResponse {
        agent_id: Uuid,
        interaction_id: Uuid,
    },
}

impl ProcessOutcome {
    /// Whether the pipeline ran to a non-error conclusion.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ProcessOutcome::Duplicate
                | ProcessOutcome::NoBinding
                | ProcessOutcome::Replied { .. }
                | ProcessOutcome::NoResponse { .. }
        )
    }
}

/// Setup status of one provider, credentials masked.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderStatus {
    pub provider: ChatProvider,
    pub configured: bool,
    pub active: bool,
    pub settings: Option<serde_json::Value>,
}

/// One optional slot per provider. Swapped as a whole on
/// reconfiguration; a live adapter is never mutated in place.
#[derive(Default)]
struct ProviderRegistry {
    slack: Option<Arc<dyn ProviderAdapter>>,
    teams: Option<Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    fn get(&self, provider: ChatProvider) -> Option<Arc<dyn ProviderAdapter>> {
        match provider {
            ChatProvider::Slack => self.slack.clone(),
            ChatProvider::Teams => self.teams.clone(),
        }
    }

    fn set(&mut self, provider: ChatProvider, adapter: Option<Arc<dyn ProviderAdapter>>) {
        match provider {
            ChatProvider::Slack => self.slack = adapter,
            ChatProvider::Teams => self.teams = adapter,
        }
    }
}

/// Resolution of the `"Name > rest"` inline-switch syntax.
struct InlineOverride {
    agent: AgentRecord,
    text: String,
    /// Replaces the "Via {agent}" footer when the named agent was not
    /// found.
    footer_note: Option<String>,
}

pub struct ChatOpsManager {
    store: Arc<dyn Store>,
    agents: Arc<dyn AgentDirectory>,
    users: Arc<dyn UserDirectory>,
    executor: Arc<dyn AgentExecutor>,
    registry: RwLock<ProviderRegistry>,
    dedup: DedupCache,
    discovery_ttl: Duration,
    processed_retention: Duration,
    socket_tx: mpsc::Sender<(ChatProvider, IncomingMessage)>,
    socket_rx: Mutex<Option<mpsc::Receiver<(ChatProvider, IncomingMessage)>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatOpsManager {
    pub fn new(
        store: Arc<dyn Store>,
        agents: Arc<dyn AgentDirectory>,
        users: Arc<dyn UserDirectory>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        let (socket_tx, socket_rx) = mpsc::channel(64);
        Self {
            store,
            agents,
            users,
            executor,
            registry: RwLock::new(ProviderRegistry::default()),
            dedup: DedupCache::new(),
            discovery_ttl: DEFAULT_DISCOVERY_TTL,
            processed_retention: DEFAULT_PROCESSED_RETENTION,
            socket_tx,
            socket_rx: Mutex::new(Some(socket_rx)),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn with_discovery_ttl(mut self, ttl: Duration) -> Self {
        self.discovery_ttl = ttl;
        self
    }

    pub fn with_processed_retention(mut self, retention: Duration) -> Self {
        self.processed_retention = retention;
        self
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn discovery_ttl(&self) -> Duration {
        self.discovery_ttl
    }

    // --- Adapter lifecycle ---

    /// The adapter currently installed for a provider.
    pub async fn adapter(&self, provider: ChatProvider) -> Option<Arc<dyn ProviderAdapter>> {
        self.registry.read().await.get(provider)
    }

    /// Install an adapter directly. Used by embedders and tests; normal
    /// startup goes through [`configure_provider`](Self::configure_provider).
    pub async fn install_adapter(
        &self,
        provider: ChatProvider,
        adapter: Arc<dyn ProviderAdapter>,
    ) {
        let previous = {
            let mut registry = self.registry.write().await;
            let previous = registry.get(provider);
            registry.set(provider, Some(adapter));
            previous
        };
        if let Some(previous) = previous {
            previous.cleanup().await;
        }
    }

    /// Load settings for every provider (seeding from the environment on
    /// first boot) and bring up the configured adapters. Per-provider
    /// failures are logged, not fatal.
    pub async fn init_from_store(&self) -> Result<(), Error> {
        for provider in ChatProvider::ALL {
            let stored = self.store.load_provider_settings(provider).await?;
            let settings = match stored {
                Some(settings) => Some(settings),
                None => match seed_from_env(provider) {
                    Ok(Some(seeded)) => {
                        self.store.save_provider_settings(&seeded).await?;
                        tracing::info!(%provider, "provider settings seeded from environment");
                        Some(seeded)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(%provider, error = %e, "incomplete provider environment");
                        None
                    }
                },
            };
            let Some(settings) = settings else {
                tracing::debug!(%provider, "provider not configured");
                continue;
            };
            if let Err(e) = self.activate(settings).await {
                tracing::warn!(%provider, error = %e, "provider initialization failed");
            }
        }
        Ok(())
    }

    /// Persist new settings and reinitialize the provider with them.
    pub async fn configure_provider(&self, settings: ProviderSettings) -> Result<(), Error> {
        self.store.save_provider_settings(&settings).await?;
        self.activate(settings).await
    }

    /// Build, initialize, and atomically swap in an adapter for the
    /// given settings.
    async fn activate(&self, settings: ProviderSettings) -> Result<(), Error> {
        let provider = settings.provider();
        let adapter: Arc<dyn ProviderAdapter> = match settings {
            ProviderSettings::Slack(slack) => {
                let connection_mode = slack.connection_mode;
                let adapter = Arc::new(SlackAdapter::new(slack));
                if !adapter.is_configured() {
                    return Err(ProviderError::NotConfigured { provider }.into());
                }
                adapter.initialize().await.map_err(Error::from)?;
                if connection_mode == ConnectionMode::SocketMode {
                    adapter
                        .start_socket_mode(self.socket_tx.clone())
                        .await
                        .map_err(Error::from)?;
                }
                adapter
            }
            ProviderSettings::Teams(teams) => {
                let adapter = Arc::new(TeamsAdapter::new(teams));
                if !adapter.is_configured() {
                    return Err(ProviderError::NotConfigured { provider }.into());
                }
                adapter.initialize().await.map_err(Error::from)?;
                adapter
            }
        };
        self.install_adapter(provider, adapter).await;
        tracing::info!(%provider, "provider adapter active");
        Ok(())
    }

    /// Spawn the background loops: the Socket Mode pump and the
    /// processed-record garbage collector.
    pub async fn start(self: &Arc<Self>) {
        let mut background = self.background.lock().await;

        if let Some(mut rx) = self.socket_rx.lock().await.take() {
            let manager = Arc::clone(self);
            background.push(tokio::spawn(async move {
                while let Some((provider, message)) = rx.recv().await {
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move {
                        manager.process_incoming(provider, message).await;
                    });
                }
            }));
        }

        let manager = Arc::clone(self);
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = chrono::Utc::now()
                    - chrono::Duration::from_std(manager.processed_retention)
                        .unwrap_or_else(|_| chrono::Duration::days(7));
                match manager.store.purge_processed_before(cutoff).await {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "purged processed-message records"),
                    Err(e) => tracing::warn!(error = %e, "processed-record purge failed"),
                }
            }
        }));
    }

    /// Stop background tasks and release every adapter session.
    pub async fn shutdown(&self) {
        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
        let registry = {
            let mut registry = self.registry.write().await;
            std::mem::take(&mut *registry)
        };
        for provider in ChatProvider::ALL {
            if let Some(adapter) = registry.get(provider) {
                adapter.cleanup().await;
            }
        }
    }

    /// Setup status for every provider, credentials masked.
    pub async fn provider_status(&self) -> Result<Vec<ProviderStatus>, Error> {
        let mut statuses = Vec::new();
        for provider in ChatProvider::ALL {
            let settings = self.store.load_provider_settings(provider).await?;
            let active = self.adapter(provider).await.is_some();
            statuses.push(ProviderStatus {
                provider,
                configured: settings.is_some(),
                active,
                settings: settings.map(|s| s.masked()),
            });
        }
        Ok(statuses)
    }

    // --- Message pipeline ---

    /// Entry point for spawned processing: runs the pipeline and logs
    /// the outcome. Errors never propagate out of the task.
    pub async fn process_incoming(self: &Arc<Self>, provider: ChatProvider, message: IncomingMessage) {
        let message_id = message.message_id.clone();
        match self.process_message(provider, message).await {
            Ok(outcome) => {
                tracing::debug!(%provider, message_id, ?outcome, "message processed");
            }
            Err(e) => {
                tracing::error!(%provider, message_id, error = %e, "message processing failed");
            }
        }
    }

    /// Run one message through the pipeline.
    pub async fn process_message(
        self: &Arc<Self>,
        provider: ChatProvider,
        message: IncomingMessage,
    ) -> Result<ProcessOutcome, PipelineError> {
        // Fast-path tier first, then the durable record. Only the
        // durable insert decides; the cache just saves the round trip.
        let dedup_key = format!("{provider}:{}", message.message_id);
        if self.dedup.mark(&dedup_key) {
            tracing::debug!(message_id = %message.message_id, "duplicate delivery (fast path)");
            return Ok(ProcessOutcome::Duplicate);
        }
        if !self
            .store
            .mark_processed(provider, &message.message_id)
            .await?
        {
            tracing::debug!(message_id = %message.message_id, "duplicate delivery (durable)");
            return Ok(ProcessOutcome::Duplicate);
        }

        let adapter = self
            .adapter(provider)
            .await
            .ok_or(PipelineError::Provider(ProviderError::NotConfigured { provider }))?;

        let Some(binding) = self
            .store
            .find_binding(provider, &message.channel_id, &message.workspace_id)
            .await?
        else {
            return Ok(ProcessOutcome::NoBinding);
        };

        let Some(agent_id) = binding.agent_id else {
            self.send_selection_prompt(&adapter, &message, &binding).await;
            return Ok(ProcessOutcome::NoAgentAssigned);
        };
        let agent = self
            .agents
            .agent_by_id(agent_id)
            .await?
            .filter(|a| a.is_internal);
        let Some(agent) = agent else {
            tracing::warn!(%agent_id, channel_id = %binding.channel_id, "bound agent no longer resolvable");
            return Ok(ProcessOutcome::AgentNotFound);
        };

        let resolved = self
            .resolve_inline_override(binding.organization_id, agent, &message)
            .await?;

        // Security check runs against the effective agent, not the
        // binding default.
        let user = match self.verify_sender(&adapter, &message, &resolved.agent).await? {
            Ok(user) => user,
            Err(denial) => {
                self.send_denial_reply(&adapter, &message, &denial).await;
                return Ok(ProcessOutcome::Denied(denial));
            }
        };

        let prompt = self
            .build_prompt(&adapter, &message, &resolved.text)
            .await;

        let request = ExecutionRequest {
            agent_id: resolved.agent.id,
            organization_id: binding.organization_id,
            message: prompt,
            user_id: user.id,
        };
        match self.executor.execute(request).await {
            Ok(outcome) if !outcome.text.trim().is_empty() => {
                let footer = resolved
                    .footer_note
                    .clone()
                    .unwrap_or_else(|| format!("Via {}", resolved.agent.name));
                self.reply_best_effort(&adapter, &message, outcome.text.clone(), Some(footer))
                    .await;
                Ok(ProcessOutcome::Replied {
                    agent_id: resolved.agent.id,
                    response: outcome.text,
                    interaction_id: outcome.interaction_id,
                })
            }
            Ok(outcome) => {
                self.replace_placeholder(&adapter, &message).await;
                Ok(ProcessOutcome::NoResponse {
                    agent_id: resolved.agent.id,
                    interaction_id: outcome.interaction_id,
                })
            }
            Err(e) => {
                tracing::error!(
                    message_id = %message.message_id,
                    agent_id = %resolved.agent.id,
                    error = %e,
                    "agent execution failed"
                );
                self.reply_best_effort(
                    &adapter,
                    &message,
                    "Sorry, something went wrong while running the agent. Please try again."
                        .to_string(),
                    None,
                )
                .await;
                Ok(ProcessOutcome::ExecutionFailed {
                    message_id: message.message_id.clone(),
                })
            }
        }
    }

    /// Resolve the `"Name > rest"` inline override. Candidates are tried
    /// longest-name-first so "Agent" cannot shadow "Agent Peter".
    async fn resolve_inline_override(
        &self,
        organization_id: Uuid,
        default_agent: AgentRecord,
        message: &IncomingMessage,
    ) -> Result<InlineOverride, PipelineError> {
        let Some((before, after)) = message.text.split_once('>') else {
            return Ok(InlineOverride {
                agent: default_agent,
                text: message.text.clone(),
                footer_note: None,
            });
        };
        let candidate = before.trim();
        if candidate.is_empty() {
            // A leading '>' is quoting, not an override.
            return Ok(InlineOverride {
                agent: default_agent,
                text: message.text.clone(),
                footer_note: None,
            });
        }

        let mut agents = self.agents.internal_agents(organization_id).await?;
        agents.sort_by(|a, b| b.name.len().cmp(&a.name.len()));
        for agent in agents {
            if matcher::matches_agent_name(candidate, &agent.name) {
                return Ok(InlineOverride {
                    agent,
                    text: after.trim().to_string(),
                    footer_note: None,
                });
            }
        }

        let note = format!(
            "Agent '{candidate}' not found, using {}",
            default_agent.name
        );
        Ok(InlineOverride {
            agent: default_agent,
            text: message.text.clone(),
            footer_note: Some(note),
        })
    }

    /// Resolve and authorize the sender against the effective agent.
    async fn verify_sender(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        message: &IncomingMessage,
        agent: &AgentRecord,
    ) -> Result<Result<UserRecord, DenialReason>, PipelineError> {
        let email = match &message.sender_email {
            Some(email) => Some(email.clone()),
            None => adapter.user_email(&message.sender_id).await,
        };
        let Some(email) = email else {
            return Ok(Err(DenialReason::IdentityUnverified));
        };

        let Some(user) = self.users.user_by_email(&email).await? else {
            return Ok(Err(DenialReason::UnknownUser { email }));
        };

        if !self.users.user_can_access_agent(&user, agent.id).await? {
            return Ok(Err(DenialReason::AccessDenied {
                agent_name: agent.name.clone(),
            }));
        }
        Ok(Ok(user))
    }

    /// Build the executor prompt, prepending thread context when the
    /// message is a reply. History failures degrade to no context.
    async fn build_prompt(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        message: &IncomingMessage,
        effective_text: &str,
    ) -> String {
        if !message.is_thread_reply {
            return effective_text.to_string();
        }
        let Some(thread_id) = &message.thread_id else {
            return effective_text.to_string();
        };
        let query = ThreadHistoryQuery {
            channel_id: message.channel_id.clone(),
            workspace_id: message.workspace_id.clone(),
            thread_id: thread_id.clone(),
            exclude_message_id: Some(message.message_id.clone()),
            limit: THREAD_HISTORY_LIMIT,
        };
        match adapter.thread_history(&query).await {
            Ok(history) if !history.is_empty() => build_thread_context(&history, effective_text),
            Ok(_) => effective_text.to_string(),
            Err(e) => {
                tracing::warn!(
                    channel_id = %message.channel_id,
                    thread_id,
                    error = %e,
                    "thread history fetch failed; continuing without context"
                );
                effective_text.to_string()
            }
        }
    }

    async fn send_denial_reply(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        message: &IncomingMessage,
        denial: &DenialReason,
    ) {
        let text = match denial {
            DenialReason::IdentityUnverified => {
                "Access Denied: your chat account has no verified email address, so your \
                 identity could not be confirmed."
                    .to_string()
            }
            DenialReason::UnknownUser { email } => {
                format!("Access Denied: {email} is not a registered user.")
            }
            DenialReason::AccessDenied { agent_name } => {
                format!("Access Denied: you do not have access to agent {agent_name}.")
            }
        };
        self.reply_best_effort(adapter, message, text, None).await;
    }

    /// Prompt the channel to pick an agent when none is bound yet.
    async fn send_selection_prompt(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        message: &IncomingMessage,
        binding: &ChannelBinding,
    ) {
        let names = match self.agents.internal_agents(binding.organization_id).await {
            Ok(agents) => agents
                .into_iter()
                .map(|a| a.name)
                .collect::<Vec<_>>()
                .join(", "),
            Err(e) => {
                tracing::warn!(error = %e, "agent listing for selection prompt failed");
                String::new()
            }
        };
        let text = if names.is_empty() {
            "No agent is assigned to this channel yet.".to_string()
        } else {
            format!(
                "No agent is assigned to this channel yet. Available agents: {names}. \
                 Assign one with `/crosswire bind <agent name>`."
            )
        };
        self.reply_best_effort(adapter, message, text, None).await;
    }

    async fn replace_placeholder(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        message: &IncomingMessage,
    ) {
        let Some(placeholder_id) = message
            .metadata
            .get(PLACEHOLDER_METADATA_KEY)
            .and_then(|v| v.as_str())
        else {
            return;
        };
        if let Err(e) = adapter
            .update_message(&message.channel_id, placeholder_id, "_(no response)_")
            .await
        {
            tracing::warn!(placeholder_id, error = %e, "placeholder replacement failed");
        }
    }

    async fn reply_best_effort(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        message: &IncomingMessage,
        text: String,
        footer: Option<String>,
    ) {
        let opts = ReplyOptions {
            channel_id: message.channel_id.clone(),
            workspace_id: message.workspace_id.clone(),
            thread_id: reply_thread(message),
            text,
            footer,
        };
        if let Err(e) = adapter.send_reply(&opts).await {
            tracing::warn!(
                channel_id = %message.channel_id,
                error = %e,
                "reply delivery failed"
            );
        }
    }

    // --- Binding operations for the command and admin surfaces ---

    /// Bind an agent to a channel by (tolerantly matched) name. The
    /// binding is created lazily when the channel is not known yet.
    pub async fn bind_agent_by_name(
        &self,
        provider: ChatProvider,
        organization_id: Uuid,
        channel_id: &str,
        workspace_id: &str,
        name: &str,
    ) -> Result<Option<AgentRecord>, PipelineError> {
        let mut agents = self.agents.internal_agents(organization_id).await?;
        agents.sort_by(|a, b| b.name.len().cmp(&a.name.len()));
        let Some(agent) = agents
            .into_iter()
            .find(|a| matcher::match_name_prefix(name.trim(), &a.name).is_some())
        else {
            return Ok(None);
        };

        self.bind_agent_to_channel(provider, organization_id, channel_id, workspace_id, agent.id)
            .await?;
        Ok(Some(agent))
    }

    /// Bind an agent to a channel by id, creating the binding lazily.
    pub async fn bind_agent_to_channel(
        &self,
        provider: ChatProvider,
        organization_id: Uuid,
        channel_id: &str,
        workspace_id: &str,
        agent_id: Uuid,
    ) -> Result<ChannelBinding, PipelineError> {
        let binding = self
            .store
            .upsert_binding(NewChannelBinding {
                organization_id,
                provider,
                channel_id: channel_id.to_string(),
                workspace_id: workspace_id.to_string(),
                workspace_name: None,
                channel_name: None,
                is_dm: false,
                dm_owner_email: None,
            })
            .await?;
        let bound = self.assign_agent(binding.id, Some(agent_id)).await?;
        tracing::info!(%provider, channel_id, %agent_id, "agent bound to channel");
        Ok(bound)
    }

    /// Assign (or clear) a binding's agent by id, for the admin API and
    /// interactive selections.
    pub async fn assign_agent(
        &self,
        binding_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<ChannelBinding, PipelineError> {
        if let Some(agent_id) = agent_id {
            let agent = self
                .agents
                .agent_by_id(agent_id)
                .await?
                .filter(|a| a.is_internal);
            if agent.is_none() {
                return Err(PipelineError::AgentUnresolved {
                    channel_id: binding_id.to_string(),
                });
            }
        }
        Ok(self.store.set_binding_agent(binding_id, agent_id).await?)
    }

    /// The organization a provider's bindings belong to, from its
    /// settings row.
    pub async fn provider_organization(
        &self,
        provider: ChatProvider,
    ) -> Result<Option<Uuid>, PipelineError> {
        Ok(self
            .store
            .load_provider_settings(provider)
            .await?
            .map(|s| s.organization_id()))
    }

    /// Internal agents available for selection surfaces.
    pub async fn selectable_agents(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<AgentRecord>, PipelineError> {
        self.agents.internal_agents(organization_id).await
    }

    /// Independently re-derive a sender's platform identity, for the
    /// command and interactive endpoints.
    pub async fn resolve_platform_user(
        &self,
        provider: ChatProvider,
        sender_id: &str,
    ) -> Result<Option<UserRecord>, PipelineError> {
        let adapter = self
            .adapter(provider)
            .await
            .ok_or(PipelineError::Provider(ProviderError::NotConfigured { provider }))?;
        let Some(email) = adapter.user_email(sender_id).await else {
            return Ok(None);
        };
        self.users.user_by_email(&email).await
    }

    /// An organization's bindings, for the admin API.
    pub async fn list_channel_bindings(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<ChannelBinding>, PipelineError> {
        Ok(self.store.list_bindings(organization_id).await?)
    }

    /// The binding for one channel, if any.
    pub async fn binding_for_channel(
        &self,
        provider: ChatProvider,
        channel_id: &str,
        workspace_id: &str,
    ) -> Result<Option<ChannelBinding>, PipelineError> {
        Ok(self
            .store
            .find_binding(provider, channel_id, workspace_id)
            .await?)
    }

    /// Delete a binding, for the admin API.
    pub async fn delete_channel_binding(&self, id: Uuid) -> Result<(), PipelineError> {
        Ok(self.store.delete_binding(id).await?)
    }
}

/// Thread to reply into: the message's thread, or the message itself as
/// a new thread root.
fn reply_thread(message: &IncomingMessage) -> Option<String> {
    message.thread_id.clone().or_else(|| {
        message
            .message_id
            .rsplit(':')
            .next()
            .map(str::to_string)
    })
}

/// Prepend prior thread messages as context, stripping the footer
/// annotation from bot-authored lines.
fn build_thread_context(history: &[ThreadMessage], current: &str) -> String {
    let mut lines = vec!["Previous conversation:".to_string()];
    for entry in history {
        let (speaker, text) = if entry.from_bot {
            ("Assistant", strip_footer(&entry.text))
        } else {
            ("User", entry.text.as_str())
        };
        lines.push(format!("{speaker}: {text}"));
    }
    lines.push(String::new());
    lines.push(format!("Current message: {current}"));
    lines.join("\n")
}

#[cfg(test)]
mod tests;
