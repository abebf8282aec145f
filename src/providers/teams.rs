//! Microsoft Teams provider adapter.
//!
//! Inbound deliveries are Bot Framework activities authenticated with
//! the outgoing-webhook HMAC: SHA-256 over the raw request bytes keyed
//! by the base64-decoded security token, compared in constant time
//! against the `Authorization: HMAC <signature>` header.
//!
//! Replies go through the connector REST API at the activity's service
//! URL; thread history and channel discovery go through Microsoft Graph.
//! Both use lazily fetched client-credential tokens.
//!
//! Teams identifies a team by two ids at once: the internal
//! `19:...@thread.tacv2` id carried on activities and the AAD group id
//! used by Graph. Both are reported as workspace-id variants so binding
//! reconciliation can clean up rows recorded under either format.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use secrecy::ExposeSecret;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::TeamsSettings;
use crate::error::ProviderError;

use super::{
    ChatProvider, DiscoveredChannel, IncomingMessage, ProviderAdapter, ReplyOptions,
    ThreadHistoryQuery, ThreadMessage, TtlCache, append_footer,
};

type HmacSha256 = Hmac<Sha256>;

/// Client-credential tokens last an hour; refresh a little early.
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(45 * 60);

/// Lifetime of cached member emails and bot-thread markers.
const LOOKUP_CACHE_TTL: Duration = Duration::from_secs(600);

const BOT_FRAMEWORK_SCOPE: &str = "https://api.botframework.com/.default";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Metadata key listing every workspace id the platform uses for the
/// activity's team.
pub const WORKSPACE_VARIANTS_METADATA_KEY: &str = "workspace_id_variants";

/// Where to reach a sender again for a member lookup.
#[derive(Clone)]
struct MemberContext {
    service_url: String,
    conversation_id: String,
}

pub struct TeamsAdapter {
    settings: TeamsSettings,
    client: reqwest::Client,
    login_base: String,
    graph_base: String,
    tokens: TtlCache<String>,
    emails: TtlCache<Option<String>>,
    /// sender id -> where that sender was last seen, for member lookups.
    member_context: Mutex<HashMap<String, MemberContext>>,
    /// channel id -> connector service URL, learned from activities.
    service_urls: Mutex<HashMap<String, String>>,
    /// team internal id -> AAD group id, learned from activities.
    team_groups: Mutex<HashMap<String, String>>,
    /// Threads the bot has posted in, so replies there skip the
    /// mention requirement.
    bot_threads: TtlCache<bool>,
}

impl TeamsAdapter {
    pub fn new(settings: TeamsSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
            login_base: "https://login.microsoftonline.com".to_string(),
            graph_base: "https://graph.microsoft.com/v1.0".to_string(),
            tokens: TtlCache::new(TOKEN_CACHE_TTL, 8),
            emails: TtlCache::new(LOOKUP_CACHE_TTL, 4096),
            member_context: Mutex::new(HashMap::new()),
            service_urls: Mutex::new(HashMap::new()),
            team_groups: Mutex::new(HashMap::new()),
            bot_threads: TtlCache::new(LOOKUP_CACHE_TTL, 4096),
        }
    }

    #[cfg(test)]
    fn with_bases(mut self, login: impl Into<String>, graph: impl Into<String>) -> Self {
        self.login_base = login.into();
        self.graph_base = graph.into();
        self
    }

    /// The bot's id as it appears in activity from/recipient fields.
    fn bot_id(&self) -> String {
        format!("28:{}", self.settings.app_id)
    }

    /// Every id this adapter knows for the given team.
    pub fn workspace_id_variants(&self, workspace_id: &str) -> Vec<String> {
        let mut variants = vec![workspace_id.to_string()];
        let groups = self.team_groups.lock().expect("team map poisoned");
        for (internal, group) in groups.iter() {
            if internal == workspace_id || group == workspace_id {
                if !variants.contains(internal) {
                    variants.push(internal.clone());
                }
                if !variants.contains(group) {
                    variants.push(group.clone());
                }
            }
        }
        variants
    }

    /// Unwrap `<at>` mention tags, dropping the bot's own mention, and
    /// decode the HTML escapes Teams applies to message text.
    fn clean_text(raw: &str, bot_name: &str) -> String {
        static AT_TAG: OnceLock<Regex> = OnceLock::new();
        static ANY_TAG: OnceLock<Regex> = OnceLock::new();
        let at_tag =
            AT_TAG.get_or_init(|| Regex::new(r"(?s)<at>(.*?)</at>").expect("valid regex"));
        let any_tag = ANY_TAG.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid regex"));

        let unwrapped = at_tag.replace_all(raw, |caps: &regex::Captures<'_>| {
            let inner = caps[1].trim();
            if inner.eq_ignore_ascii_case(bot_name) {
                String::new()
            } else {
                inner.to_string()
            }
        });
        let stripped = any_tag.replace_all(&unwrapped, "");
        stripped
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&")
            .trim()
            .to_string()
    }

    /// Conversation id addressing a channel, optionally inside a thread.
    fn conversation_id(channel_id: &str, thread_id: Option<&str>) -> String {
        match thread_id {
            Some(thread) => format!("{channel_id};messageid={thread}"),
            None => channel_id.to_string(),
        }
    }

    /// Split `19:...@thread.tacv2;messageid=169` into channel and thread.
    fn split_conversation_id(conversation_id: &str) -> (String, Option<String>) {
        match conversation_id.split_once(";messageid=") {
            Some((channel, thread)) => (channel.to_string(), Some(thread.to_string())),
            None => (conversation_id.to_string(), None),
        }
    }

    async fn token(&self, scope: &str) -> Result<String, ProviderError> {
        if let Some(token) = self.tokens.get(scope) {
            return Ok(token);
        }
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_base, self.settings.tenant_id
        );
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.settings.app_id.as_str()),
            ("client_secret", self.settings.app_password.expose_secret()),
            ("scope", scope),
        ];
        let payload: serde_json::Value =
            self.client.post(&url).form(&form).send().await?.json().await?;
        let token = payload["access_token"]
            .as_str()
            .ok_or_else(|| ProviderError::ApiCall {
                provider: ChatProvider::Teams,
                method: "oauth2/v2.0/token".to_string(),
                reason: payload["error_description"]
                    .as_str()
                    .unwrap_or("no access_token in response")
                    .to_string(),
            })?;
        self.tokens.insert(scope, token.to_string());
        Ok(token.to_string())
    }

    async fn graph_get(&self, path: &str) -> Result<serde_json::Value, ProviderError> {
        let token = self.token(GRAPH_SCOPE).await?;
        let response = self
            .client
            .get(format!("{}{path}", self.graph_base))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(ProviderError::ApiCall {
                provider: ChatProvider::Teams,
                method: path.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        Ok(response.json().await?)
    }

    /// Resolve a team's AAD group id from whichever id the caller has.
    fn group_id_for(&self, workspace_id: &str) -> Option<String> {
        if !workspace_id.contains("@thread") {
            // Already a GUID-format group id.
            return Some(workspace_id.to_string());
        }
        self.team_groups
            .lock()
            .expect("team map poisoned")
            .get(workspace_id)
            .cloned()
    }

    fn strip_html(content: &str) -> String {
        static ANY_TAG: OnceLock<Regex> = OnceLock::new();
        let any_tag = ANY_TAG.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid regex"));
        any_tag
            .replace_all(content, "")
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&")
            .trim()
            .to_string()
    }

    fn graph_reply_to_thread_message(value: &serde_json::Value) -> Option<ThreadMessage> {
        let text = Self::strip_html(value["body"]["content"].as_str()?);
        if text.is_empty() {
            return None;
        }
        let from_bot = value["from"]["application"].is_object();
        let sender_id = value["from"]["user"]["id"]
            .as_str()
            .or(value["from"]["application"]["id"].as_str())
            .unwrap_or_default()
            .to_string();
        let timestamp = value["createdDateTime"]
            .as_str()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        Some(ThreadMessage {
            sender_id,
            text,
            from_bot,
            timestamp,
        })
    }

    /// Member lookup through the connector API, which accepts the
    /// `29:` sender id the activity carries.
    async fn fetch_member_email(&self, sender_id: &str) -> Option<String> {
        let context = self
            .member_context
            .lock()
            .expect("member map poisoned")
            .get(sender_id)
            .cloned()?;
        let token = match self.token(BOT_FRAMEWORK_SCOPE).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "connector token fetch failed");
                return None;
            }
        };
        let url = format!(
            "{}/v3/conversations/{}/members/{}",
            context.service_url.trim_end_matches('/'),
            context.conversation_id,
            sender_id
        );
        let member: serde_json::Value = match self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => match response.json().await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(sender_id, error = %e, "member lookup returned non-JSON");
                    return None;
                }
            },
            Err(e) => {
                tracing::warn!(sender_id, error = %e, "member lookup failed");
                return None;
            }
        };
        member["email"]
            .as_str()
            .or(member["userPrincipalName"].as_str())
            .map(str::to_string)
    }
}

#[async_trait]
impl ProviderAdapter for TeamsAdapter {
    fn provider(&self) -> ChatProvider {
        ChatProvider::Teams
    }

    fn is_configured(&self) -> bool {
        !self.settings.app_id.is_empty()
            && !self.settings.app_password.expose_secret().is_empty()
            && !self.settings.security_token.expose_secret().is_empty()
            && !self.settings.tenant_id.is_empty()
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        if !self.is_configured() {
            return Err(ProviderError::NotConfigured {
                provider: ChatProvider::Teams,
            });
        }
        // Tokens are fetched lazily; nothing to acquire eagerly.
        tracing::info!(app_id = %self.settings.app_id, "Teams adapter initialized");
        Ok(())
    }

    async fn cleanup(&self) {
        self.tokens.clear();
        self.emails.clear();
        self.bot_threads.clear();
        self.member_context.lock().expect("member map poisoned").clear();
    }

    fn validate_webhook(&self, raw_body: &[u8], headers: &HeaderMap) -> bool {
        let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let Some(signature) = auth.strip_prefix("HMAC ") else {
            return false;
        };
        let Ok(key) = BASE64.decode(self.settings.security_token.expose_secret()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
            return false;
        };
        mac.update(raw_body);
        let expected = BASE64.encode(mac.finalize().into_bytes());
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }

    async fn parse_webhook(
        &self,
        payload: &serde_json::Value,
        _headers: &HeaderMap,
    ) -> Option<IncomingMessage> {
        if payload["type"].as_str() != Some("message") {
            return None;
        }
        let activity_id = payload["id"].as_str()?;
        let sender_id = payload["from"]["id"].as_str().unwrap_or_default();
        let raw_text = payload["text"].as_str().unwrap_or_default();
        let conversation = payload["conversation"]["id"].as_str().unwrap_or_default();
        if sender_id.is_empty() || raw_text.is_empty() || conversation.is_empty() {
            return None;
        }
        if sender_id == self.bot_id() {
            return None;
        }

        let conversation_type = payload["conversation"]["conversationType"]
            .as_str()
            .unwrap_or("channel");
        let is_dm = conversation_type == "personal";
        let (channel_id, thread_id) = Self::split_conversation_id(conversation);
        let is_thread_reply = thread_id.as_deref().is_some_and(|t| t != activity_id);

        let channel_data = &payload["channelData"];
        let team_internal_id = channel_data["team"]["id"]
            .as_str()
            .or(channel_data["teamsTeamId"].as_str())
            .unwrap_or_default()
            .to_string();
        let aad_group_id = channel_data["team"]["aadGroupId"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let tenant_id = channel_data["tenant"]["id"]
            .as_str()
            .or(payload["conversation"]["tenantId"].as_str())
            .unwrap_or_default()
            .to_string();

        let workspace_id = if is_dm {
            tenant_id.clone()
        } else if !team_internal_id.is_empty() {
            team_internal_id.clone()
        } else {
            tenant_id.clone()
        };

        // Mention gating: in channels the bot answers when addressed or
        // when the reply lands in a thread it has posted in.
        let bot_name = payload["recipient"]["name"].as_str().unwrap_or_default();
        if !is_dm {
            let mentioned = payload["entities"]
                .as_array()
                .into_iter()
                .flatten()
                .any(|e| {
                    e["type"].as_str() == Some("mention")
                        && e["mentioned"]["id"].as_str() == Some(self.bot_id().as_str())
                })
                || raw_text.contains("<at>");
            if !mentioned {
                let in_bot_thread = thread_id
                    .as_deref()
                    .is_some_and(|t| {
                        self.bot_threads.get(&format!("{channel_id}:{t}")).unwrap_or(false)
                    });
                if !in_bot_thread {
                    return None;
                }
            }
        }

        // Remember how to reach this conversation again.
        if let Some(service_url) = payload["serviceUrl"].as_str() {
            self.service_urls
                .lock()
                .expect("service url map poisoned")
                .insert(channel_id.clone(), service_url.to_string());
            self.member_context
                .lock()
                .expect("member map poisoned")
                .insert(
                    sender_id.to_string(),
                    MemberContext {
                        service_url: service_url.to_string(),
                        conversation_id: conversation.to_string(),
                    },
                );
        }
        if !team_internal_id.is_empty() && !aad_group_id.is_empty() {
            self.team_groups
                .lock()
                .expect("team map poisoned")
                .insert(team_internal_id.clone(), aad_group_id.clone());
        }

        let mut variants = vec![workspace_id.clone()];
        if !aad_group_id.is_empty() && !variants.contains(&aad_group_id) {
            variants.push(aad_group_id.clone());
        }

        let timestamp = payload["timestamp"]
            .as_str()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut metadata = serde_json::json!({ "conversation_type": conversation_type });
        metadata[WORKSPACE_VARIANTS_METADATA_KEY] = serde_json::json!(variants);

        Some(IncomingMessage {
            message_id: format!("{channel_id}:{activity_id}"),
            channel_id,
            workspace_id,
            thread_id,
            sender_id: sender_id.to_string(),
            sender_name: payload["from"]["name"]
                .as_str()
                .unwrap_or(sender_id)
                .to_string(),
            sender_email: self.emails.get(sender_id).flatten(),
            text: Self::clean_text(raw_text, bot_name),
            raw_text: raw_text.to_string(),
            timestamp,
            is_thread_reply,
            metadata,
        })
    }

    async fn send_reply(&self, opts: &ReplyOptions) -> Result<String, ProviderError> {
        let service_url = self
            .service_urls
            .lock()
            .expect("service url map poisoned")
            .get(&opts.channel_id)
            .cloned()
            .ok_or_else(|| ProviderError::DeliveryFailed {
                channel_id: opts.channel_id.clone(),
                reason: "no service URL known for channel".to_string(),
            })?;
        let conversation = Self::conversation_id(&opts.channel_id, opts.thread_id.as_deref());
        let text = match &opts.footer {
            Some(footer) => append_footer(&opts.text, footer),
            None => opts.text.clone(),
        };
        let token = self.token(BOT_FRAMEWORK_SCOPE).await?;
        let url = format!(
            "{}/v3/conversations/{}/activities",
            service_url.trim_end_matches('/'),
            conversation
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({
                "type": "message",
                "from": { "id": self.bot_id() },
                "conversation": { "id": conversation },
                "text": text,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(ProviderError::DeliveryFailed {
                channel_id: opts.channel_id.clone(),
                reason: format!("HTTP {status}"),
            });
        }
        let payload: serde_json::Value = response.json().await?;
        let delivery_id = payload["id"].as_str().unwrap_or_default().to_string();

        // Replies from us make their thread answerable without mentions.
        let thread_key = match &opts.thread_id {
            Some(thread) => format!("{}:{}", opts.channel_id, thread),
            None => format!("{}:{}", opts.channel_id, delivery_id),
        };
        self.bot_threads.insert(thread_key, true);
        Ok(delivery_id)
    }

    async fn update_message(
        &self,
        _channel_id: &str,
        _message_id: &str,
        _text: &str,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            provider: ChatProvider::Teams,
            operation: "update_message".to_string(),
        })
    }

    async fn thread_history(
        &self,
        query: &ThreadHistoryQuery,
    ) -> Result<Vec<ThreadMessage>, ProviderError> {
        let group_id =
            self.group_id_for(&query.workspace_id)
                .ok_or_else(|| ProviderError::ApiCall {
                    provider: ChatProvider::Teams,
                    method: "thread_history".to_string(),
                    reason: format!("no AAD group id known for team {}", query.workspace_id),
                })?;
        let exclude = query
            .exclude_message_id
            .as_deref()
            .map(|id| id.rsplit(':').next().unwrap_or(id).to_string());

        let mut history = Vec::new();

        // Thread root first, best-effort.
        let root_path = format!(
            "/teams/{group_id}/channels/{}/messages/{}",
            query.channel_id, query.thread_id
        );
        match self.graph_get(&root_path).await {
            Ok(root) => {
                if exclude.as_deref() != root["id"].as_str()
                    && let Some(message) = Self::graph_reply_to_thread_message(&root)
                {
                    history.push(message);
                }
            }
            Err(e) => tracing::warn!(error = %e, "thread root fetch failed"),
        }

        let replies_path = format!(
            "/teams/{group_id}/channels/{}/messages/{}/replies?$top={}",
            query.channel_id, query.thread_id, query.limit
        );
        let payload = self.graph_get(&replies_path).await?;
        let mut replies: Vec<ThreadMessage> = payload["value"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|v| exclude.as_deref() != v["id"].as_str())
            .filter_map(Self::graph_reply_to_thread_message)
            .collect();
        replies.sort_by_key(|m| m.timestamp);
        history.extend(replies);
        Ok(history)
    }

    async fn user_email(&self, sender_id: &str) -> Option<String> {
        if let Some(cached) = self.emails.get(sender_id) {
            return cached;
        }
        let email = self.fetch_member_email(sender_id).await;
        self.emails.insert(sender_id, email.clone());
        email
    }

    async fn discover_channels(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<DiscoveredChannel>, ProviderError> {
        let group_id =
            self.group_id_for(workspace_id)
                .ok_or_else(|| ProviderError::ApiCall {
                    provider: ChatProvider::Teams,
                    method: "discover_channels".to_string(),
                    reason: format!("no AAD group id known for team {workspace_id}"),
                })?;

        let workspace_name = match self.graph_get(&format!("/teams/{group_id}")).await {
            Ok(team) => team["displayName"].as_str().map(str::to_string),
            Err(e) => {
                tracing::warn!(error = %e, "team name fetch failed");
                None
            }
        };

        let payload = self
            .graph_get(&format!("/teams/{group_id}/channels"))
            .await?;
        let channels = payload["value"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|channel| {
                let id = channel["id"].as_str()?;
                Some(DiscoveredChannel {
                    channel_id: id.to_string(),
                    channel_name: channel["displayName"].as_str().map(str::to_string),
                    workspace_id: workspace_id.to_string(),
                    workspace_name: workspace_name.clone(),
                    is_dm: false,
                    dm_owner_email: None,
                })
            })
            .collect();
        Ok(channels)
    }
}
