//! Error types for Crosswire.

use uuid::Uuid;

use crate::providers::ChatProvider;

/// Top-level error type for the routing engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Ingress error: {0}")]
    Ingress(#[from] IngressError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Provider {provider} is not configured")]
    ProviderNotConfigured { provider: ChatProvider },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Persistence errors for bindings, processed-message records, and
/// provider settings.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Binding not found: {id}")]
    BindingNotFound { id: Uuid },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::BuildError),

    #[cfg(feature = "postgres")]
    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),
}

/// Provider adapter errors (platform API calls, live sessions).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} is not configured")]
    NotConfigured { provider: ChatProvider },

    #[error("Provider {provider} initialization failed: {reason}")]
    InitFailed { provider: ChatProvider, reason: String },

    #[error("{provider} API call {method} failed: {reason}")]
    ApiCall {
        provider: ChatProvider,
        method: String,
        reason: String,
    },

    #[error("{provider} rejected the request: {reason}")]
    Rejected { provider: ChatProvider, reason: String },

    #[error("Operation {operation} is not supported by {provider}")]
    Unsupported {
        provider: ChatProvider,
        operation: String,
    },

    #[error("Failed to deliver reply to {channel_id}: {reason}")]
    DeliveryFailed { channel_id: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message-pipeline errors surfaced by the manager.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No agent could be resolved for channel {channel_id}")]
    AgentUnresolved { channel_id: String },

    #[error("Sender identity could not be verified: {reason}")]
    IdentityUnverified { reason: String },

    #[error("User {email} is not authorized for agent {agent_id}")]
    NotAuthorized { email: String, agent_id: Uuid },

    #[error("Agent execution failed for message {message_id}: {reason}")]
    ExecutionFailed { message_id: String, reason: String },

    #[error("Collaborator lookup failed: {0}")]
    Lookup(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Webhook ingress errors. Everything here terminates at the HTTP
/// boundary as a status code, never as a propagated panic.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("Signature verification failed")]
    BadSignature,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Unknown provider route: {0}")]
    UnknownProvider(String),

    #[error("Internal error")]
    Internal,
}

/// Result type alias for the routing engine.
pub type Result<T> = std::result::Result<T, Error>;
