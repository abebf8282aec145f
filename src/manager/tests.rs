//! Pipeline tests against the in-memory store with mock collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::backend::AgentRecord;
use crate::backend::testing::{MockAgents, MockExecutor, MockUsers, agent, user};
use crate::error::PipelineError;
use crate::providers::testing::MockAdapter;
use crate::providers::{ChatProvider, DiscoveredChannel, IncomingMessage, ThreadMessage};
use crate::store::{MemoryStore, NewChannelBinding, Store};

use super::{ChatOpsManager, DenialReason, ProcessOutcome};

// --- Harness ---

struct Harness {
    manager: Arc<ChatOpsManager>,
    store: Arc<MemoryStore>,
    adapter: Arc<MockAdapter>,
    executor: Arc<MockExecutor>,
    org: Uuid,
    sales_agent: AgentRecord,
    short_agent: AgentRecord,
}

async fn harness(adapter: MockAdapter, executor: MockExecutor) -> Harness {
    let org = Uuid::new_v4();
    let sales_agent = agent(org, "Sales Agent");
    let short_agent = agent(org, "Sales");

    let store = Arc::new(MemoryStore::new());
    let peter = user("peter@example.com");
    let mut access = HashSet::new();
    access.insert((peter.id, sales_agent.id));
    access.insert((peter.id, short_agent.id));
    let users = MockUsers {
        users: HashMap::from([(peter.email.clone(), peter)]),
        access,
    };

    let adapter = Arc::new(adapter);
    let executor = Arc::new(executor);
    let manager = Arc::new(ChatOpsManager::new(
        store.clone(),
        Arc::new(MockAgents {
            agents: vec![sales_agent.clone(), short_agent.clone()],
        }),
        Arc::new(users),
        executor.clone(),
    ));
    manager
        .install_adapter(ChatProvider::Slack, adapter.clone())
        .await;

    Harness {
        manager,
        store,
        adapter,
        executor,
        org,
        sales_agent,
        short_agent,
    }
}

impl Harness {
    async fn bound_channel(&self, agent_id: Option<Uuid>) -> Uuid {
        let binding = self
            .store
            .upsert_binding(NewChannelBinding {
                organization_id: self.org,
                provider: ChatProvider::Slack,
                channel_id: "C1".to_string(),
                workspace_id: "T1".to_string(),
                workspace_name: None,
                channel_name: None,
                is_dm: false,
                dm_owner_email: None,
            })
            .await
            .unwrap();
        if agent_id.is_some() {
            self.store
                .set_binding_agent(binding.id, agent_id)
                .await
                .unwrap();
        }
        binding.id
    }
}

fn message(text: &str) -> IncomingMessage {
    IncomingMessage {
        message_id: "C1:1700000000.000100".to_string(),
        channel_id: "C1".to_string(),
        workspace_id: "T1".to_string(),
        thread_id: None,
        sender_id: "U1".to_string(),
        sender_name: "Peter".to_string(),
        sender_email: None,
        text: text.to_string(),
        raw_text: text.to_string(),
        timestamp: Utc::now(),
        is_thread_reply: false,
        metadata: serde_json::json!({}),
    }
}

fn adapter_with_email() -> MockAdapter {
    MockAdapter {
        emails: HashMap::from([("U1".to_string(), "peter@example.com".to_string())]),
        ..MockAdapter::default()
    }
}

// --- Pipeline ---

#[tokio::test]
async fn test_duplicate_message_executes_once() {
    let h = harness(adapter_with_email(), MockExecutor::answering("hi")).await;
    h.bound_channel(Some(h.sales_agent.id)).await;

    let first = h
        .manager
        .process_message(ChatProvider::Slack, message("hello"))
        .await
        .unwrap();
    assert!(matches!(first, ProcessOutcome::Replied { .. }));

    let second = h
        .manager
        .process_message(ChatProvider::Slack, message("hello"))
        .await
        .unwrap();
    assert!(matches!(second, ProcessOutcome::Duplicate));
    assert!(second.is_success());

    assert_eq!(h.executor.calls().len(), 1);
    assert_eq!(h.adapter.sent_replies().len(), 1);
}

#[tokio::test]
async fn test_durable_tier_catches_duplicates_without_fast_path() {
    let h = harness(adapter_with_email(), MockExecutor::answering("hi")).await;
    h.bound_channel(Some(h.sales_agent.id)).await;

    // Pre-mark in the durable store, as if another process won the race.
    assert!(h
        .store
        .mark_processed(ChatProvider::Slack, "C1:1700000000.000100")
        .await
        .unwrap());

    let outcome = h
        .manager
        .process_message(ChatProvider::Slack, message("hello"))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Duplicate));
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn test_unbound_channel_is_a_soft_noop() {
    let h = harness(adapter_with_email(), MockExecutor::answering("hi")).await;
    let outcome = h
        .manager
        .process_message(ChatProvider::Slack, message("hello"))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::NoBinding));
    assert!(h.adapter.sent_replies().is_empty());
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn test_agentless_binding_sends_selection_prompt() {
    let h = harness(adapter_with_email(), MockExecutor::answering("hi")).await;
    h.bound_channel(None).await;

    let outcome = h
        .manager
        .process_message(ChatProvider::Slack, message("hello"))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::NoAgentAssigned));

    let replies = h.adapter.sent_replies();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].text.contains("No agent is assigned"));
    assert!(replies[0].text.contains("Sales Agent"));
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn test_vanished_agent_is_reported() {
    let h = harness(adapter_with_email(), MockExecutor::answering("hi")).await;
    h.bound_channel(Some(Uuid::new_v4())).await;

    let outcome = h
        .manager
        .process_message(ChatProvider::Slack, message("hello"))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::AgentNotFound));
    assert!(!outcome.is_success());
}

#[tokio::test]
async fn test_inline_override_selects_longest_name_first() {
    let h = harness(adapter_with_email(), MockExecutor::answering("$40k")).await;
    // Default is the short "Sales" agent; the override names the longer one.
    h.bound_channel(Some(h.short_agent.id)).await;

    let outcome = h
        .manager
        .process_message(
            ChatProvider::Slack,
            message("Sales Agent > what's my quota"),
        )
        .await
        .unwrap();

    match outcome {
        ProcessOutcome::Replied { agent_id, .. } => assert_eq!(agent_id, h.sales_agent.id),
        other => panic!("expected Replied, got {other:?}"),
    }
    let calls = h.executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].agent_id, h.sales_agent.id);
    assert_eq!(calls[0].message, "what's my quota");

    let replies = h.adapter.sent_replies();
    assert_eq!(replies[0].footer.as_deref(), Some("Via Sales Agent"));
}

#[tokio::test]
async fn test_inline_override_tolerates_collapsed_spelling() {
    let h = harness(adapter_with_email(), MockExecutor::answering("ok")).await;
    h.bound_channel(Some(h.short_agent.id)).await;

    let outcome = h
        .manager
        .process_message(ChatProvider::Slack, message("salesagent > ping"))
        .await
        .unwrap();
    match outcome {
        ProcessOutcome::Replied { agent_id, .. } => assert_eq!(agent_id, h.sales_agent.id),
        other => panic!("expected Replied, got {other:?}"),
    }
}

#[tokio::test]
async fn test_inline_override_miss_keeps_default_with_note() {
    let h = harness(adapter_with_email(), MockExecutor::answering("ok")).await;
    h.bound_channel(Some(h.sales_agent.id)).await;

    let outcome = h
        .manager
        .process_message(ChatProvider::Slack, message("Ghost Agent > hello"))
        .await
        .unwrap();
    match outcome {
        ProcessOutcome::Replied { agent_id, .. } => assert_eq!(agent_id, h.sales_agent.id),
        other => panic!("expected Replied, got {other:?}"),
    }
    // The full original text goes downstream on a miss.
    assert_eq!(h.executor.calls()[0].message, "Ghost Agent > hello");
    let footer = h.adapter.sent_replies()[0].footer.clone().unwrap();
    assert!(footer.contains("Ghost Agent"));
    assert!(footer.contains("not found"));
    assert!(footer.contains("Sales Agent"));
}

#[tokio::test]
async fn test_leading_quote_is_not_an_override() {
    let h = harness(adapter_with_email(), MockExecutor::answering("ok")).await;
    h.bound_channel(Some(h.sales_agent.id)).await;

    h.manager
        .process_message(ChatProvider::Slack, message("> quoted text"))
        .await
        .unwrap();
    assert_eq!(h.executor.calls()[0].message, "> quoted text");
    assert_eq!(
        h.adapter.sent_replies()[0].footer.as_deref(),
        Some("Via Sales Agent")
    );
}

// --- Security ---

#[tokio::test]
async fn test_unresolvable_email_never_reaches_execution() {
    // Adapter with no email mapping at all.
    let h = harness(MockAdapter::default(), MockExecutor::answering("ok")).await;
    h.bound_channel(Some(h.sales_agent.id)).await;

    let outcome = h
        .manager
        .process_message(ChatProvider::Slack, message("hello"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Denied(DenialReason::IdentityUnverified)
    ));
    assert!(h.executor.calls().is_empty());
    let replies = h.adapter.sent_replies();
    assert!(replies[0].text.contains("Access Denied"));
}

#[tokio::test]
async fn test_unregistered_email_is_denied_with_email_in_reply() {
    let adapter = MockAdapter {
        emails: HashMap::from([("U1".to_string(), "stranger@example.com".to_string())]),
        ..MockAdapter::default()
    };
    let h = harness(adapter, MockExecutor::answering("ok")).await;
    h.bound_channel(Some(h.sales_agent.id)).await;

    let outcome = h
        .manager
        .process_message(ChatProvider::Slack, message("hello"))
        .await
        .unwrap();
    match outcome {
        ProcessOutcome::Denied(DenialReason::UnknownUser { email }) => {
            assert_eq!(email, "stranger@example.com");
        }
        other => panic!("expected UnknownUser denial, got {other:?}"),
    }
    assert!(h.adapter.sent_replies()[0]
        .text
        .contains("stranger@example.com"));
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn test_authorization_applies_to_effective_agent() {
    let org = Uuid::new_v4();
    let default_agent = agent(org, "Helpdesk");
    let restricted = agent(org, "Payroll Agent");

    let peter = user("peter@example.com");
    let mut access = HashSet::new();
    // Peter may use the default agent but not the override target.
    access.insert((peter.id, default_agent.id));

    let store = Arc::new(MemoryStore::new());
    let adapter = Arc::new(adapter_with_email());
    let executor = Arc::new(MockExecutor::answering("ok"));
    let manager = Arc::new(ChatOpsManager::new(
        store.clone(),
        Arc::new(MockAgents {
            agents: vec![default_agent.clone(), restricted.clone()],
        }),
        Arc::new(MockUsers {
            users: HashMap::from([(peter.email.clone(), peter)]),
            access,
        }),
        executor.clone(),
    ));
    manager
        .install_adapter(ChatProvider::Slack, adapter.clone())
        .await;

    let binding = store
        .upsert_binding(NewChannelBinding {
            organization_id: org,
            provider: ChatProvider::Slack,
            channel_id: "C1".to_string(),
            workspace_id: "T1".to_string(),
            workspace_name: None,
            channel_name: None,
            is_dm: false,
            dm_owner_email: None,
        })
        .await
        .unwrap();
    store
        .set_binding_agent(binding.id, Some(default_agent.id))
        .await
        .unwrap();

    let outcome = manager
        .process_message(ChatProvider::Slack, message("Payroll Agent > raise please"))
        .await
        .unwrap();
    match outcome {
        ProcessOutcome::Denied(DenialReason::AccessDenied { agent_name }) => {
            assert_eq!(agent_name, "Payroll Agent");
        }
        other => panic!("expected AccessDenied, got {other:?}"),
    }
    assert!(executor.calls().is_empty());
    assert!(adapter.sent_replies()[0].text.contains("Payroll Agent"));
}

// --- Context, replies, failures ---

#[tokio::test]
async fn test_thread_reply_gets_context_with_footers_stripped() {
    let adapter = MockAdapter {
        emails: HashMap::from([("U1".to_string(), "peter@example.com".to_string())]),
        history: vec![
            ThreadMessage {
                sender_id: "U1".to_string(),
                text: "what's our quota?".to_string(),
                from_bot: false,
                timestamp: None,
            },
            ThreadMessage {
                sender_id: "UBOT".to_string(),
                text: "It is $40k\n\n_Via Sales Agent_".to_string(),
                from_bot: true,
                timestamp: None,
            },
        ],
        ..MockAdapter::default()
    };
    let h = harness(adapter, MockExecutor::answering("ok")).await;
    h.bound_channel(Some(h.sales_agent.id)).await;

    let mut msg = message("and next year?");
    msg.thread_id = Some("1700000000.000001".to_string());
    msg.is_thread_reply = true;

    h.manager
        .process_message(ChatProvider::Slack, msg)
        .await
        .unwrap();

    let prompt = h.executor.calls()[0].message.clone();
    assert!(prompt.starts_with("Previous conversation:"));
    assert!(prompt.contains("User: what's our quota?"));
    assert!(prompt.contains("Assistant: It is $40k"));
    assert!(!prompt.contains("_Via Sales Agent_"));
    assert!(prompt.contains("Current message: and next year?"));
}

#[tokio::test]
async fn test_empty_response_replaces_placeholder() {
    let h = harness(adapter_with_email(), MockExecutor::answering("   ")).await;
    h.bound_channel(Some(h.sales_agent.id)).await;

    let mut msg = message("hello");
    msg.metadata = serde_json::json!({ "placeholder_message_id": "1700.5" });

    let outcome = h
        .manager
        .process_message(ChatProvider::Slack, msg)
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::NoResponse { .. }));
    assert!(h.adapter.sent_replies().is_empty());

    let updates = h.adapter.recorded_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1, "1700.5");
    assert!(updates[0].2.contains("no response"));
}

#[tokio::test]
async fn test_execution_failure_sends_apology() {
    let h = harness(adapter_with_email(), MockExecutor::failing("boom")).await;
    h.bound_channel(Some(h.sales_agent.id)).await;

    let outcome = h
        .manager
        .process_message(ChatProvider::Slack, message("hello"))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::ExecutionFailed { .. }));
    let replies = h.adapter.sent_replies();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].text.contains("something went wrong"));
    assert!(replies[0].footer.is_none());
}

// --- Binding operations ---

#[tokio::test]
async fn test_bind_agent_by_name_is_tolerant_and_lazy() {
    let h = harness(adapter_with_email(), MockExecutor::answering("ok")).await;

    let bound = h
        .manager
        .bind_agent_by_name(ChatProvider::Slack, h.org, "C9", "T1", "salesagent")
        .await
        .unwrap()
        .expect("agent should match");
    assert_eq!(bound.id, h.sales_agent.id);

    let binding = h
        .store
        .find_binding(ChatProvider::Slack, "C9", "T1")
        .await
        .unwrap()
        .expect("binding created lazily");
    assert_eq!(binding.agent_id, Some(h.sales_agent.id));
}

#[tokio::test]
async fn test_bind_agent_by_name_unknown_is_none() {
    let h = harness(adapter_with_email(), MockExecutor::answering("ok")).await;
    let bound = h
        .manager
        .bind_agent_by_name(ChatProvider::Slack, h.org, "C9", "T1", "Ghost")
        .await
        .unwrap();
    assert!(bound.is_none());
}

#[tokio::test]
async fn test_assign_agent_rejects_unknown_agent() {
    let h = harness(adapter_with_email(), MockExecutor::answering("ok")).await;
    let binding_id = h.bound_channel(None).await;
    let err = h
        .manager
        .assign_agent(binding_id, Some(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::AgentUnresolved { .. }));
}

// --- Discovery reconciliation ---

fn live_channel(id: &str, workspace: &str) -> DiscoveredChannel {
    DiscoveredChannel {
        channel_id: id.to_string(),
        channel_name: Some(format!("#{id}")),
        workspace_id: workspace.to_string(),
        workspace_name: Some("Acme".to_string()),
        is_dm: false,
        dm_owner_email: None,
    }
}

async fn seed_binding(store: &MemoryStore, org: Uuid, channel: &str, workspace: &str) -> Uuid {
    store
        .upsert_binding(NewChannelBinding {
            organization_id: org,
            provider: ChatProvider::Slack,
            channel_id: channel.to_string(),
            workspace_id: workspace.to_string(),
            workspace_name: None,
            channel_name: None,
            is_dm: false,
            dm_owner_email: None,
        })
        .await
        .unwrap()
        .id
}

async fn discovery_harness(live: Vec<DiscoveredChannel>) -> Harness {
    let adapter = MockAdapter {
        live_channels: live,
        ..MockAdapter::default()
    };
    let h = harness(adapter, MockExecutor::answering("ok")).await;
    // Discovery reads the organization from the settings row.
    h.store
        .save_provider_settings(&crate::config::ProviderSettings::Slack(
            crate::config::SlackSettings {
                organization_id: h.org,
                bot_token: secrecy::SecretString::from("xoxb-1".to_string()),
                signing_secret: secrecy::SecretString::from("s1".to_string()),
                app_token: None,
                connection_mode: crate::config::ConnectionMode::Webhook,
            },
        ))
        .await
        .unwrap();
    h
}

#[tokio::test]
async fn test_discovery_removes_vanished_channels_across_variants() {
    let h = discovery_harness(vec![live_channel("C1", "T1")]).await;
    seed_binding(&h.store, h.org, "C1", "T1").await;
    // The same workspace under an alternate id format.
    seed_binding(&h.store, h.org, "GONE", "T1").await;
    seed_binding(&h.store, h.org, "GONE", "T1-alt").await;
    // A different workspace entirely stays untouched.
    seed_binding(&h.store, h.org, "OTHER", "T2").await;

    let report = h
        .manager
        .discover_channels(ChatProvider::Slack, "T1", &["T1-alt".to_string()], None)
        .await
        .unwrap();
    assert_eq!(report.removed, 2);

    assert!(h.store.find_binding(ChatProvider::Slack, "C1", "T1").await.unwrap().is_some());
    assert!(h.store.find_binding(ChatProvider::Slack, "GONE", "T1").await.unwrap().is_none());
    assert!(h.store.find_binding(ChatProvider::Slack, "GONE", "T1-alt").await.unwrap().is_none());
    assert!(h.store.find_binding(ChatProvider::Slack, "OTHER", "T2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_discovery_collapses_duplicate_workspace_formats() {
    let h = discovery_harness(vec![live_channel("C1", "T1")]).await;
    let keeper = seed_binding(&h.store, h.org, "C1", "T1").await;
    h.store
        .set_binding_agent(keeper, Some(h.sales_agent.id))
        .await
        .unwrap();
    // Same live channel recorded earlier under the alternate format.
    // It survives deletion (the channel is live) but collapses as a
    // duplicate.
    seed_binding(&h.store, h.org, "C1", "T1-alt").await;

    let report = h
        .manager
        .discover_channels(ChatProvider::Slack, "T1", &["T1-alt".to_string()], None)
        .await
        .unwrap();
    assert_eq!(report.collapsed, 1);

    let kept = h
        .store
        .find_binding(ChatProvider::Slack, "C1", "T1")
        .await
        .unwrap()
        .expect("agent-bearing row wins");
    assert_eq!(kept.agent_id, Some(h.sales_agent.id));
    assert!(h
        .store
        .find_binding(ChatProvider::Slack, "C1", "T1-alt")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_discovery_protects_in_flight_pair() {
    // The message being processed lives under a workspace-id variant
    // whose channel is missing from the live list.
    let h = discovery_harness(vec![live_channel("C1", "T1")]).await;
    seed_binding(&h.store, h.org, "C2", "T1").await;

    let report = h
        .manager
        .discover_channels(
            ChatProvider::Slack,
            "T1",
            &[],
            Some(("C2", "T1")),
        )
        .await
        .unwrap();
    assert_eq!(report.removed, 0);
    assert!(h.store.find_binding(ChatProvider::Slack, "C2", "T1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_discovery_respects_ttl_cache() {
    let h = discovery_harness(vec![live_channel("C1", "T1")]).await;
    let first = h
        .manager
        .discover_channels(ChatProvider::Slack, "T1", &[], None)
        .await
        .unwrap();
    assert!(!first.skipped);
    assert_eq!(first.upserted, 1);

    let second = h
        .manager
        .discover_channels(ChatProvider::Slack, "T1", &[], None)
        .await
        .unwrap();
    assert!(second.skipped);
}

#[tokio::test]
async fn test_discovery_creates_agentless_bindings_with_names() {
    let h = discovery_harness(vec![live_channel("C1", "T1"), live_channel("C2", "T1")]).await;
    let report = h
        .manager
        .discover_channels(ChatProvider::Slack, "T1", &[], None)
        .await
        .unwrap();
    assert_eq!(report.upserted, 2);

    let binding = h
        .store
        .find_binding(ChatProvider::Slack, "C2", "T1")
        .await
        .unwrap()
        .unwrap();
    assert!(binding.agent_id.is_none());
    assert_eq!(binding.channel_name.as_deref(), Some("#C2"));
    assert_eq!(binding.workspace_name.as_deref(), Some("Acme"));
}
