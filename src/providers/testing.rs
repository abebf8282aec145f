//! Configurable in-memory adapter for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;

use crate::error::ProviderError;

use super::{
    ChatProvider, DiscoveredChannel, IncomingMessage, ProviderAdapter, ReplyOptions,
    ThreadHistoryQuery, ThreadMessage,
};

/// Test adapter: canned lookups, recorded outbound calls.
pub(crate) struct MockAdapter {
    pub provider: ChatProvider,
    pub valid_signature: bool,
    pub emails: HashMap<String, String>,
    pub history: Vec<ThreadMessage>,
    pub live_channels: Vec<DiscoveredChannel>,
    pub replies: Mutex<Vec<ReplyOptions>>,
    pub updates: Mutex<Vec<(String, String, String)>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self {
            provider: ChatProvider::Slack,
            valid_signature: true,
            emails: HashMap::new(),
            history: Vec::new(),
            live_channels: Vec::new(),
            replies: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
        }
    }
}

impl MockAdapter {
    pub fn sent_replies(&self) -> Vec<ReplyOptions> {
        self.replies.lock().unwrap().clone()
    }

    pub fn recorded_updates(&self) -> Vec<(String, String, String)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider(&self) -> ChatProvider {
        self.provider
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn cleanup(&self) {}

    fn validate_webhook(&self, _raw_body: &[u8], _headers: &HeaderMap) -> bool {
        self.valid_signature
    }

    /// Minimal parse: accepts `{"message_id", "channel_id",
    /// "workspace_id", "sender_id", "text"}` test payloads.
    async fn parse_webhook(
        &self,
        payload: &serde_json::Value,
        _headers: &HeaderMap,
    ) -> Option<IncomingMessage> {
        let message_id = payload["message_id"].as_str()?;
        Some(IncomingMessage {
            message_id: message_id.to_string(),
            channel_id: payload["channel_id"].as_str().unwrap_or("C1").to_string(),
            workspace_id: payload["workspace_id"].as_str().unwrap_or("T1").to_string(),
            thread_id: None,
            sender_id: payload["sender_id"].as_str().unwrap_or("U1").to_string(),
            sender_name: "Tester".to_string(),
            sender_email: None,
            text: payload["text"].as_str().unwrap_or_default().to_string(),
            raw_text: payload["text"].as_str().unwrap_or_default().to_string(),
            timestamp: Utc::now(),
            is_thread_reply: false,
            metadata: serde_json::json!({}),
        })
    }

    async fn send_reply(&self, opts: &ReplyOptions) -> Result<String, ProviderError> {
        self.replies.lock().unwrap().push(opts.clone());
        Ok("delivery-1".to_string())
    }

    async fn update_message(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ProviderError> {
        self.updates.lock().unwrap().push((
            channel_id.to_string(),
            message_id.to_string(),
            text.to_string(),
        ));
        Ok(())
    }

    async fn thread_history(
        &self,
        _query: &ThreadHistoryQuery,
    ) -> Result<Vec<ThreadMessage>, ProviderError> {
        Ok(self.history.clone())
    }

    async fn user_email(&self, sender_id: &str) -> Option<String> {
        self.emails.get(sender_id).cloned()
    }

    async fn discover_channels(
        &self,
        _workspace_id: &str,
    ) -> Result<Vec<DiscoveredChannel>, ProviderError> {
        Ok(self.live_channels.clone())
    }
}
