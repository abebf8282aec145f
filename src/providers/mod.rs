//! Provider adapters for workspace chat platforms.
//!
//! Each supported platform implements [`ProviderAdapter`]: webhook
//! signature verification, notification parsing, reply delivery, thread
//! history, user-email resolution, and channel discovery. The manager
//! drives adapters through this one capability set and never speaks a
//! platform protocol itself.
//!
//! [`ChatProvider`] is a closed enum. Call sites that branch on provider
//! match exhaustively, so adding a platform forces every branch to be
//! revisited.

mod cache;
pub mod slack;
pub mod teams;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ProviderError};

pub(crate) use cache::TtlCache;
pub use slack::SlackAdapter;
pub use teams::TeamsAdapter;

/// Supported chat platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatProvider {
    Slack,
    Teams,
}

impl ChatProvider {
    /// Every supported provider, for iteration in status reporting.
    pub const ALL: [ChatProvider; 2] = [ChatProvider::Slack, ChatProvider::Teams];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatProvider::Slack => "slack",
            ChatProvider::Teams => "teams",
        }
    }
}

impl std::fmt::Display for ChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChatProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slack" => Ok(ChatProvider::Slack),
            "teams" | "msteams" => Ok(ChatProvider::Teams),
            other => Err(ConfigError::InvalidValue {
                key: "provider".to_string(),
                message: format!("unknown provider '{other}'"),
            }),
        }
    }
}

/// A normalized inbound chat message, constructed per webhook delivery
/// and never persisted. `message_id` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: String,
    pub channel_id: String,
    pub workspace_id: String,
    pub thread_id: Option<String>,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_email: Option<String>,
    /// Visible text with the bot mention stripped and platform escaping
    /// decoded.
    pub text: String,
    /// The text exactly as the platform delivered it.
    pub raw_text: String,
    pub timestamp: DateTime<Utc>,
    pub is_thread_reply: bool,
    /// Provider extras, e.g. the Socket Mode "thinking" placeholder id
    /// under `placeholder_message_id`.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Metadata key carrying the id of a placeholder message the provider
/// already posted while the agent runs.
pub const PLACEHOLDER_METADATA_KEY: &str = "placeholder_message_id";

/// One message of a thread's history.
#[derive(Debug, Clone)]
pub struct ThreadMessage {
    pub sender_id: String,
    pub text: String,
    pub from_bot: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A channel the bot is a member of, as reported by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredChannel {
    pub channel_id: String,
    pub channel_name: Option<String>,
    pub workspace_id: String,
    pub workspace_name: Option<String>,
    pub is_dm: bool,
    pub dm_owner_email: Option<String>,
}

/// Outbound reply parameters.
#[derive(Debug, Clone)]
pub struct ReplyOptions {
    pub channel_id: String,
    pub workspace_id: String,
    pub thread_id: Option<String>,
    pub text: String,
    /// Short annotation identifying which agent answered, rendered by
    /// the adapter in the platform's small-print style.
    pub footer: Option<String>,
}

/// Parameters for a thread-history fetch.
#[derive(Debug, Clone)]
pub struct ThreadHistoryQuery {
    pub channel_id: String,
    pub workspace_id: String,
    pub thread_id: String,
    /// Message to leave out (normally the one being processed).
    pub exclude_message_id: Option<String>,
    pub limit: usize,
}

/// The per-platform capability set.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> ChatProvider;

    /// Pure function of stored credentials; gates initialization and
    /// feeds setup-status reporting.
    fn is_configured(&self) -> bool;

    /// Acquire the live platform session. Only called when configured.
    async fn initialize(&self) -> Result<(), ProviderError>;

    /// Release the live session, tearing down any persistent
    /// subscription (e.g. a Socket Mode connection).
    async fn cleanup(&self);

    /// Verify a webhook delivery against the platform's signing scheme,
    /// over the exact raw request bytes. Never panics and never errors;
    /// anything suspect is `false`.
    fn validate_webhook(&self, raw_body: &[u8], headers: &HeaderMap) -> bool;

    /// Filter and extract an inbound message from a webhook payload.
    /// Returns `None` for event types, senders, or channels the pipeline
    /// should ignore.
    async fn parse_webhook(
        &self,
        payload: &serde_json::Value,
        headers: &HeaderMap,
    ) -> Option<IncomingMessage>;

    /// Post a reply into a channel/thread. Returns the platform's id for
    /// the delivered message.
    async fn send_reply(&self, opts: &ReplyOptions) -> Result<String, ProviderError>;

    /// Edit a previously posted message (placeholder replacement).
    async fn update_message(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ProviderError>;

    /// Prior messages of a thread, oldest first, bot-authored flagged.
    async fn thread_history(
        &self,
        query: &ThreadHistoryQuery,
    ) -> Result<Vec<ThreadMessage>, ProviderError>;

    /// Resolve a platform user id to an email address, with a short-TTL
    /// cache behind it. `None` when the platform has no email on file.
    async fn user_email(&self, sender_id: &str) -> Option<String>;

    /// List channels the bot is a member of.
    async fn discover_channels(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<DiscoveredChannel>, ProviderError>;
}

/// Render a reply body with its footer annotation appended.
pub fn append_footer(text: &str, footer: &str) -> String {
    format!("{text}\n\n_{footer}_")
}

/// Remove a trailing footer annotation from a bot-authored message, so
/// thread history fed back to the agent does not accumulate footers.
pub fn strip_footer(text: &str) -> &str {
    if let Some(idx) = text.rfind("\n\n_") {
        let tail = &text[idx + 2..];
        if tail.ends_with('_') && (tail.starts_with("_Via ") || tail.starts_with("_Agent ")) {
            return text[..idx].trim_end();
        }
    }
    text
}
