//! In-memory collaborator fakes shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::PipelineError;

use super::{
    AgentDirectory, AgentExecutor, AgentRecord, ExecutionOutcome, ExecutionRequest, UserDirectory,
    UserRecord,
};

pub(crate) struct MockAgents {
    pub agents: Vec<AgentRecord>,
}

#[async_trait]
impl AgentDirectory for MockAgents {
    async fn agent_by_id(&self, id: Uuid) -> Result<Option<AgentRecord>, PipelineError> {
        Ok(self.agents.iter().find(|a| a.id == id).cloned())
    }

    async fn internal_agents(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<AgentRecord>, PipelineError> {
        Ok(self
            .agents
            .iter()
            .filter(|a| a.organization_id == organization_id && a.is_internal)
            .cloned()
            .collect())
    }
}

pub(crate) struct MockUsers {
    pub users: HashMap<String, UserRecord>,
    pub access: HashSet<(Uuid, Uuid)>,
}

#[async_trait]
impl UserDirectory for MockUsers {
    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, PipelineError> {
        Ok(self.users.get(email).cloned())
    }

    async fn user_can_access_agent(
        &self,
        user: &UserRecord,
        agent_id: Uuid,
    ) -> Result<bool, PipelineError> {
        Ok(user.is_admin || self.access.contains(&(user.id, agent_id)))
    }
}

pub(crate) struct MockExecutor {
    pub response: Result<String, String>,
    pub calls: Mutex<Vec<ExecutionRequest>>,
}

impl MockExecutor {
    pub fn answering(text: &str) -> Self {
        Self {
            response: Ok(text.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            response: Err(reason.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentExecutor for MockExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, PipelineError> {
        self.calls.lock().unwrap().push(request.clone());
        match &self.response {
            Ok(text) => Ok(ExecutionOutcome {
                text: text.clone(),
                interaction_id: Uuid::new_v4(),
            }),
            Err(reason) => Err(PipelineError::ExecutionFailed {
                message_id: "test".to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

/// An internal agent in the given organization.
pub(crate) fn agent(org: Uuid, name: &str) -> AgentRecord {
    AgentRecord {
        id: Uuid::new_v4(),
        organization_id: org,
        name: name.to_string(),
        is_internal: true,
    }
}

/// A registered, non-admin user.
pub(crate) fn user(email: &str) -> UserRecord {
    UserRecord {
        id: Uuid::new_v4(),
        email: email.to_string(),
        display_name: Some("Peter".to_string()),
        is_admin: false,
    }
}
