//! Webhook ingress: HTTP termination for provider deliveries plus the
//! admin API.
//!
//! Every webhook route follows the same discipline: rate limit first,
//! then signature verification over the exact raw request bytes (the
//! body is captured as `Bytes` before any JSON parsing so re-encoding
//! can never corrupt the HMAC input), then parsing. The request is
//! acknowledged immediately; message processing continues in a spawned
//! task that logs its own failures. Nothing thrown inside a handler
//! escapes as anything but 400/429/500 with a generic message.

mod ratelimit;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Extension, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use bytes::Bytes;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::ProviderSettings;
use crate::error::{PipelineError, StoreError};
use crate::manager::ChatOpsManager;
use crate::providers::teams::WORKSPACE_VARIANTS_METADATA_KEY;
use crate::providers::{ChatProvider, IncomingMessage, ProviderAdapter};

pub use ratelimit::RateLimiter;

/// Shared state for every ingress route.
#[derive(Clone)]
pub struct IngressState {
    manager: Arc<ChatOpsManager>,
    limiter: Arc<RateLimiter>,
}

/// Build the ingress router with default rate limits.
pub fn router(manager: Arc<ChatOpsManager>) -> Router {
    router_with_limiter(manager, RateLimiter::new())
}

/// Build the ingress router with a custom limiter (tests, tuning).
pub fn router_with_limiter(manager: Arc<ChatOpsManager>, limiter: RateLimiter) -> Router {
    let state = IngressState {
        manager,
        limiter: Arc::new(limiter),
    };
    Router::new()
        .route("/webhooks/slack/events", post(slack_events))
        .route("/webhooks/slack/commands", post(slack_commands))
        .route("/webhooks/slack/interactive", post(slack_interactive))
        .route("/webhooks/teams/messages", post(teams_messages))
        .route("/api/bindings", get(list_bindings))
        .route(
            "/api/bindings/{id}",
            axum::routing::patch(update_binding).delete(delete_binding),
        )
        .route("/api/providers/status", get(providers_status))
        .route("/api/providers/{provider}/config", put(update_provider_config))
        .route("/api/providers/{provider}/discovery", post(force_discovery))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Client identity for rate limiting: proxy header first, socket peer
/// second.
fn client_ip(headers: &HeaderMap, connect: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| connect.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rate limit, then fetch the provider's adapter and verify the
/// delivery. Returns the adapter or the error response to send.
async fn admit_webhook(
    state: &IngressState,
    provider: ChatProvider,
    headers: &HeaderMap,
    connect: Option<SocketAddr>,
    body: &Bytes,
) -> Result<Arc<dyn ProviderAdapter>, Response> {
    let ip = client_ip(headers, connect);
    if !state.limiter.allow(&ip) {
        return Err(StatusCode::TOO_MANY_REQUESTS.into_response());
    }
    let Some(adapter) = state.manager.adapter(provider).await else {
        return Err((StatusCode::BAD_REQUEST, "provider not configured").into_response());
    };
    if !adapter.validate_webhook(body, headers) {
        tracing::warn!(%provider, ip, "webhook signature verification failed");
        return Err((StatusCode::BAD_REQUEST, "signature verification failed").into_response());
    }
    Ok(adapter)
}

/// Ack-now, process-later: parsing and the pipeline run in a spawned
/// task so the provider's delivery timeout is never at risk.
fn spawn_message_processing(
    manager: Arc<ChatOpsManager>,
    adapter: Arc<dyn ProviderAdapter>,
    provider: ChatProvider,
    payload: serde_json::Value,
    headers: HeaderMap,
) {
    tokio::spawn(async move {
        let Some(message) = adapter.parse_webhook(&payload, &headers).await else {
            return;
        };
        manager.spawn_discovery(
            provider,
            message.workspace_id.clone(),
            workspace_variants(&message),
            Some((message.channel_id.clone(), message.workspace_id.clone())),
        );
        manager.process_incoming(provider, message).await;
    });
}

/// Alternate workspace-id formats the adapter attached to the message.
fn workspace_variants(message: &IncomingMessage) -> Vec<String> {
    message
        .metadata
        .get(WORKSPACE_VARIANTS_METADATA_KEY)
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// --- Slack routes ---

async fn slack_events(
    State(state): State<IngressState>,
    connect: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let adapter = match admit_webhook(
        &state,
        ChatProvider::Slack,
        &headers,
        connect.map(|c| c.0.0),
        &body,
    )
    .await
    {
        Ok(adapter) => adapter,
        Err(response) => return response,
    };

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed payload").into_response(),
    };

    // The URL-verification handshake is answered only after the
    // signature has checked out.
    if payload["type"].as_str() == Some("url_verification") {
        let challenge = payload["challenge"].as_str().unwrap_or_default();
        return Json(serde_json::json!({ "challenge": challenge })).into_response();
    }

    spawn_message_processing(
        state.manager.clone(),
        adapter,
        ChatProvider::Slack,
        payload,
        headers,
    );
    StatusCode::OK.into_response()
}

#[derive(Debug, Deserialize)]
struct SlackCommandPayload {
    #[serde(default)]
    text: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    team_id: String,
    #[serde(default)]
    user_id: String,
}

async fn slack_commands(
    State(state): State<IngressState>,
    connect: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = admit_webhook(
        &state,
        ChatProvider::Slack,
        &headers,
        connect.map(|c| c.0.0),
        &body,
    )
    .await
    {
        return response;
    }

    let payload: SlackCommandPayload = match serde_urlencoded::from_bytes(&body) {
        Ok(payload) => payload,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed payload").into_response(),
    };

    let text = match handle_slack_command(&state.manager, &payload).await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "slash command handling failed");
            "Something went wrong handling that command.".to_string()
        }
    };
    Json(serde_json::json!({ "response_type": "ephemeral", "text": text })).into_response()
}

async fn handle_slack_command(
    manager: &Arc<ChatOpsManager>,
    payload: &SlackCommandPayload,
) -> Result<String, PipelineError> {
    const USAGE: &str =
        "Commands: `agents`, `bind <agent name>`, `status`, `unbind`.";

    let Some(organization_id) = manager.provider_organization(ChatProvider::Slack).await? else {
        return Ok("Slack is not fully configured yet.".to_string());
    };
    let text = payload.text.trim();
    let verb = text.split_whitespace().next().unwrap_or("");

    match verb {
        "" | "help" => Ok(USAGE.to_string()),
        "agents" => {
            let agents = manager.selectable_agents(organization_id).await?;
            if agents.is_empty() {
                Ok("No agents are available yet.".to_string())
            } else {
                let names: Vec<String> = agents.into_iter().map(|a| a.name).collect();
                Ok(format!("Available agents: {}", names.join(", ")))
            }
        }
        "status" => {
            let binding = manager
                .binding_for_channel(ChatProvider::Slack, &payload.channel_id, &payload.team_id)
                .await?;
            match binding.and_then(|b| b.agent_id) {
                Some(agent_id) => Ok(format!("This channel is bound to agent {agent_id}.")),
                None => Ok("No agent is assigned to this channel.".to_string()),
            }
        }
        "unbind" => {
            let binding = manager
                .binding_for_channel(ChatProvider::Slack, &payload.channel_id, &payload.team_id)
                .await?;
            match binding {
                Some(binding) => {
                    manager.assign_agent(binding.id, None).await?;
                    Ok("Agent unbound from this channel.".to_string())
                }
                None => Ok("This channel has no binding.".to_string()),
            }
        }
        "bind" => {
            let name = text.strip_prefix("bind").unwrap_or_default().trim();
            if name.is_empty() {
                return Ok("Usage: `bind <agent name>`".to_string());
            }
            // Commands re-derive sender identity; the channel id in the
            // form body is attacker-controlled only past the signature.
            let user = manager
                .resolve_platform_user(ChatProvider::Slack, &payload.user_id)
                .await?;
            if user.is_none() {
                return Ok(
                    "Access Denied: your chat account could not be matched to a registered user."
                        .to_string(),
                );
            }
            match manager
                .bind_agent_by_name(
                    ChatProvider::Slack,
                    organization_id,
                    &payload.channel_id,
                    &payload.team_id,
                    name,
                )
                .await?
            {
                Some(agent) => Ok(format!("This channel now routes to {}.", agent.name)),
                None => Ok(format!("No agent named '{name}'.")),
            }
        }
        other => Ok(format!("Unknown command '{other}'. {USAGE}")),
    }
}

#[derive(Debug, Deserialize)]
struct InteractiveEnvelope {
    payload: String,
}

/// Action id of the agent-selection buttons the selection prompt posts.
const SELECT_AGENT_ACTION: &str = "crosswire_select_agent";

async fn slack_interactive(
    State(state): State<IngressState>,
    connect: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = admit_webhook(
        &state,
        ChatProvider::Slack,
        &headers,
        connect.map(|c| c.0.0),
        &body,
    )
    .await
    {
        return response;
    }

    let envelope: InteractiveEnvelope = match serde_urlencoded::from_bytes(&body) {
        Ok(envelope) => envelope,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed payload").into_response(),
    };
    let payload: serde_json::Value = match serde_json::from_str(&envelope.payload) {
        Ok(payload) => payload,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed payload").into_response(),
    };
    if payload["type"].as_str() != Some("block_actions") {
        return StatusCode::OK.into_response();
    }

    let text = match handle_agent_selection(&state.manager, &payload).await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "interactive selection failed");
            "Something went wrong assigning that agent.".to_string()
        }
    };
    Json(serde_json::json!({ "response_type": "ephemeral", "text": text })).into_response()
}

async fn handle_agent_selection(
    manager: &Arc<ChatOpsManager>,
    payload: &serde_json::Value,
) -> Result<String, PipelineError> {
    let Some(action) = payload["actions"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|a| a["action_id"].as_str() == Some(SELECT_AGENT_ACTION))
    else {
        return Ok("Nothing to do.".to_string());
    };
    let Some(agent_id) = action["value"].as_str().and_then(|v| v.parse::<Uuid>().ok()) else {
        return Ok("That selection is no longer valid.".to_string());
    };
    let channel_id = payload["channel"]["id"].as_str().unwrap_or_default();
    let workspace_id = payload["team"]["id"].as_str().unwrap_or_default();
    let sender_id = payload["user"]["id"].as_str().unwrap_or_default();

    let Some(organization_id) = manager.provider_organization(ChatProvider::Slack).await? else {
        return Ok("Slack is not fully configured yet.".to_string());
    };
    let user = manager
        .resolve_platform_user(ChatProvider::Slack, sender_id)
        .await?;
    if user.is_none() {
        return Ok(
            "Access Denied: your chat account could not be matched to a registered user."
                .to_string(),
        );
    }

    manager
        .bind_agent_to_channel(
            ChatProvider::Slack,
            organization_id,
            channel_id,
            workspace_id,
            agent_id,
        )
        .await?;
    Ok("Agent assigned to this channel.".to_string())
}

// --- Teams routes ---

async fn teams_messages(
    State(state): State<IngressState>,
    connect: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let adapter = match admit_webhook(
        &state,
        ChatProvider::Teams,
        &headers,
        connect.map(|c| c.0.0),
        &body,
    )
    .await
    {
        Ok(adapter) => adapter,
        Err(response) => return response,
    };

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed payload").into_response(),
    };

    spawn_message_processing(
        state.manager.clone(),
        adapter,
        ChatProvider::Teams,
        payload,
        headers,
    );
    Json(serde_json::json!({})).into_response()
}

// --- Admin API ---

fn admin_error(e: PipelineError) -> Response {
    match e {
        PipelineError::Store(StoreError::BindingNotFound { .. }) => {
            (StatusCode::NOT_FOUND, "binding not found").into_response()
        }
        PipelineError::AgentUnresolved { .. } => {
            (StatusCode::BAD_REQUEST, "unknown agent").into_response()
        }
        other => {
            tracing::error!(error = %other, "admin API failure");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

async fn list_bindings(
    State(state): State<IngressState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(organization_id) = params
        .get("organization_id")
        .and_then(|raw| raw.parse::<Uuid>().ok())
    else {
        return (StatusCode::BAD_REQUEST, "organization_id is required").into_response();
    };
    match state.manager.list_channel_bindings(organization_id).await {
        Ok(bindings) => Json(bindings).into_response(),
        Err(e) => admin_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateBindingBody {
    /// New agent for the binding; null clears the assignment.
    agent_id: Option<Uuid>,
}

async fn update_binding(
    State(state): State<IngressState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateBindingBody>,
) -> Response {
    match state.manager.assign_agent(id, body.agent_id).await {
        Ok(binding) => Json(binding).into_response(),
        Err(e) => admin_error(e),
    }
}

async fn delete_binding(State(state): State<IngressState>, Path(id): Path<Uuid>) -> Response {
    match state.manager.delete_channel_binding(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => admin_error(e),
    }
}

async fn providers_status(State(state): State<IngressState>) -> Response {
    match state.manager.provider_status().await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "provider status failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

async fn update_provider_config(
    State(state): State<IngressState>,
    Path(provider): Path<String>,
    Json(settings): Json<ProviderSettings>,
) -> Response {
    let Ok(provider) = provider.parse::<ChatProvider>() else {
        return (StatusCode::BAD_REQUEST, "unknown provider").into_response();
    };
    if settings.provider() != provider {
        return (StatusCode::BAD_REQUEST, "provider mismatch").into_response();
    }
    match state.manager.configure_provider(settings).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(crate::error::Error::Config(e)) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(crate::error::Error::Provider(e)) => {
            tracing::warn!(%provider, error = %e, "provider reinitialize failed");
            (StatusCode::BAD_REQUEST, "provider initialization failed").into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "provider config update failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryBody {
    workspace_id: String,
}

async fn force_discovery(
    State(state): State<IngressState>,
    Path(provider): Path<String>,
    Json(body): Json<DiscoveryBody>,
) -> Response {
    let Ok(provider) = provider.parse::<ChatProvider>() else {
        return (StatusCode::BAD_REQUEST, "unknown provider").into_response();
    };
    match state
        .manager
        .refresh_discovery(provider, &body.workspace_id)
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(e) => admin_error(e),
    }
}

#[cfg(test)]
mod tests;
