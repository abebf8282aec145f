//! Contracts for the surrounding platform.
//!
//! Agent CRUD, user accounts, permissions, and the LLM execution engine
//! all live outside this crate. The routing engine only needs the
//! narrow lookups below; production wires them to the platform's
//! internal API via [`HttpBackend`], tests substitute in-memory fakes.

mod http;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::PipelineError;

pub use http::HttpBackend;

/// An agent as the directory knows it.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    /// Only internal agents may be bound to channels and executed from
    /// chat. External/marketplace agents are visible but not routable.
    pub is_internal: bool,
}

/// A registered platform user, resolved from a verified email address.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub is_admin: bool,
}

/// Agent lookups, scoped to an organization.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn agent_by_id(&self, id: Uuid) -> Result<Option<AgentRecord>, PipelineError>;

    /// All internal agents of an organization. Used for inline-override
    /// resolution and the agent-selection surfaces.
    async fn internal_agents(&self, organization_id: Uuid)
        -> Result<Vec<AgentRecord>, PipelineError>;
}

/// User lookups and the authorization check.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, PipelineError>;

    /// Whether the user may run the agent. Admin override is applied
    /// inside the collaborator, not here.
    async fn user_can_access_agent(
        &self,
        user: &UserRecord,
        agent_id: Uuid,
    ) -> Result<bool, PipelineError>;
}

/// Parameters for one agent execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub agent_id: Uuid,
    pub organization_id: Uuid,
    /// The constructed message, thread context included.
    pub message: String,
    /// The verified platform user, never the raw chat sender id.
    pub user_id: Uuid,
}

/// What the execution engine returned.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub text: String,
    /// Interaction id for observability and billing.
    pub interaction_id: Uuid,
}

/// The opaque agent-execution call.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, PipelineError>;
}
