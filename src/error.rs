//! Error types for the fuel coordinator.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Advisor error: {0}")]
    Advisor(#[from] AdvisorError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Concurrent update conflict on {entity} {id} after {attempts} attempts")]
    Contention {
        entity: String,
        id: String,
        attempts: u32,
    },
}

/// Mailbox and outbound mail errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mailbox connection to {host} failed: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("Mailbox authentication failed for {user}")]
    AuthFailed { user: String },

    #[error("Mailbox command {command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Message {uid} could not be parsed")]
    Unparseable { uid: String },

    #[error("Failed to send mail to {to}: {reason}")]
    SendFailed { to: String, reason: String },

    #[error("Mail task panicked: {0}")]
    TaskPanicked(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// ETA extraction errors. Every variant triggers the pattern fallback.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Model extraction unavailable: {0}")]
    Unavailable(String),

    #[error("Model output could not be parsed: {0}")]
    Unparsable(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Escalation advisor errors. Every variant is downgraded to a dismissal.
#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    #[error("Advisor timed out after {0:?}")]
    Timeout(Duration),

    #[error("Advisor output malformed: {0}")]
    Malformed(String),

    #[error("Advisor value out of domain: {field} = {value}")]
    OutOfDomain { field: String, value: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Agent run errors.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Agent {agent_id} not found")]
    AgentNotFound { agent_id: String },

    #[error("Agent {agent_id} is disabled")]
    AgentDisabled { agent_id: String },

    #[error("Agent {agent_id} already has a run in progress")]
    AlreadyRunning { agent_id: String },

    #[error("Run {id} not found")]
    NotFound { id: Uuid },

    #[error("Run {id} cancelled: {reason}")]
    Cancelled { id: Uuid, reason: String },

    #[error("Run {id} was finalized by another task")]
    Superseded { id: Uuid },

    #[error("Run {id} panicked: {reason}")]
    Panicked { id: Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the coordinator.
pub type Result<T> = std::result::Result<T, Error>;
