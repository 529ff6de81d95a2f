//! Workflow error types

use thiserror::Error;

use crate::agent::ValueKind;

/// Errors that can occur while building or running a workflow
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A required input key is absent and has no default
    #[error("Agent '{agent}' is missing input '{key}'")]
    InputMissing { agent: String, key: String },

    /// The underlying unit raised
    #[error("Node '{node}' failed: {source}")]
    ExecutionFailed {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// A unit returned a value incompatible with its declared output
    #[error("Agent '{agent}' returned {actual} for '{key}', expected {expected}")]
    OutputTypeMismatch {
        agent: String,
        key: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    /// A typed scope read found an incompatible value
    #[error("Value under '{key}' is not a {expected}: {source}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A typed scope read found nothing
    #[error("Key not found in scope: {0}")]
    KeyMissing(String),

    /// No conditional branch accepted the scope
    #[error("No branch of '{node}' matched")]
    NoBranchMatched { node: String },

    /// A loop ran out of iterations under a failing cap policy
    #[error("Loop '{node}' reached {iterations} iterations without exiting")]
    MaxIterationsReached { node: String, iterations: usize },

    /// The join-time aggregation function failed
    #[error("Aggregation in '{node}' failed: {source}")]
    AggregationFailed {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// The planner cannot reach its goal
    #[error("No plan reaches '{goal}' (unresolved: {})", missing.join(", "))]
    PlanNotFound { goal: String, missing: Vec<String> },

    /// The delegation strategy itself failed
    #[error("Delegation in '{node}' failed: {source}")]
    Delegation {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// Human input could not be obtained
    #[error("Human input for '{key}' failed: {reason}")]
    HumanInput { key: String, reason: String },

    /// The invocation was cancelled
    #[error("Invocation cancelled")]
    Cancelled,

    /// Workflow not registered with the orchestrator
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Channel error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl WorkflowError {
    /// Wrap a unit failure raised by `node`
    pub fn execution(node: impl Into<String>, source: anyhow::Error) -> Self {
        Self::ExecutionFailed {
            node: node.into(),
            source,
        }
    }

    /// Whether a recovery descriptor may act on this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::ConfigError(_))
    }
}

pub type Result<T, E = WorkflowError> = std::result::Result<T, E>;
