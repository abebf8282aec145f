//! HTTP client for the platform's internal API.
//!
//! Implements the collaborator contracts against the service that owns
//! agents, users, permissions, and execution. Authenticated with a
//! service token; every call is a small JSON request/response.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::PipelineError;

use super::{
    AgentDirectory, AgentExecutor, AgentRecord, ExecutionOutcome, ExecutionRequest, UserDirectory,
    UserRecord,
};

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    service_token: SecretString,
}

#[derive(Debug, Deserialize)]
struct AgentPayload {
    id: Uuid,
    organization_id: Uuid,
    name: String,
    #[serde(default)]
    is_internal: bool,
}

impl From<AgentPayload> for AgentRecord {
    fn from(payload: AgentPayload) -> Self {
        AgentRecord {
            id: payload.id,
            organization_id: payload.organization_id,
            name: payload.name,
            is_internal: payload.is_internal,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: Uuid,
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    is_admin: bool,
}

impl From<UserPayload> for UserRecord {
    fn from(payload: UserPayload) -> Self {
        UserRecord {
            id: payload.id,
            email: payload.email,
            display_name: payload.display_name,
            is_admin: payload.is_admin,
        }
    }
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, service_token: SecretString) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            service_token,
        }
    }

    /// GET a JSON resource; `Ok(None)` on 404.
    async fn get_opt<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, PipelineError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(self.service_token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| PipelineError::Lookup(format!("GET {path}: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(PipelineError::Lookup(format!(
                "GET {path}: HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| PipelineError::Lookup(format!("GET {path}: {e}")))
    }
}

#[async_trait]
impl AgentDirectory for HttpBackend {
    async fn agent_by_id(&self, id: Uuid) -> Result<Option<AgentRecord>, PipelineError> {
        let agent: Option<AgentPayload> = self.get_opt(&format!("/api/agents/{id}"), &[]).await?;
        Ok(agent.map(AgentRecord::from))
    }

    async fn internal_agents(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<AgentRecord>, PipelineError> {
        let agents: Option<Vec<AgentPayload>> = self
            .get_opt(
                &format!("/api/organizations/{organization_id}/agents"),
                &[("internal", "true")],
            )
            .await?;
        Ok(agents
            .unwrap_or_default()
            .into_iter()
            .map(AgentRecord::from)
            .collect())
    }
}

#[async_trait]
impl UserDirectory for HttpBackend {
    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, PipelineError> {
        let user: Option<UserPayload> = self
            .get_opt("/api/users/lookup", &[("email", email)])
            .await?;
        Ok(user.map(UserRecord::from))
    }

    async fn user_can_access_agent(
        &self,
        user: &UserRecord,
        agent_id: Uuid,
    ) -> Result<bool, PipelineError> {
        #[derive(Deserialize)]
        struct AccessPayload {
            allowed: bool,
        }
        let access: Option<AccessPayload> = self
            .get_opt(
                &format!("/api/users/{}/agents/{agent_id}/access", user.id),
                &[],
            )
            .await?;
        Ok(access.is_some_and(|a| a.allowed))
    }
}

#[async_trait]
impl AgentExecutor for HttpBackend {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, PipelineError> {
        #[derive(Deserialize)]
        struct ExecutionPayload {
            text: String,
            interaction_id: Uuid,
        }
        let response = self
            .client
            .post(format!("{}/api/executions", self.base_url))
            .bearer_auth(self.service_token.expose_secret())
            .json(&serde_json::json!({
                "agent_id": request.agent_id,
                "organization_id": request.organization_id,
                "message": request.message,
                "user_id": request.user_id,
            }))
            .send()
            .await
            .map_err(|e| PipelineError::ExecutionFailed {
                message_id: String::new(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(PipelineError::ExecutionFailed {
                message_id: String::new(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        let payload: ExecutionPayload =
            response
                .json()
                .await
                .map_err(|e| PipelineError::ExecutionFailed {
                    message_id: String::new(),
                    reason: e.to_string(),
                })?;
        Ok(ExecutionOutcome {
            text: payload.text,
            interaction_id: payload.interaction_id,
        })
    }
}
