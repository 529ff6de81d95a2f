//! Events emitted while a workflow runs

use serde::Serialize;
use serde_json::Value;

use crate::looping::LoopState;
use crate::scope::InvocationId;

/// Progress events reported to an attached sink
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    InvocationStarted {
        invocation: InvocationId,
        workflow: String,
    },
    InvocationCompleted {
        invocation: InvocationId,
        workflow: String,
        output: Option<Value>,
    },
    InvocationFailed {
        invocation: InvocationId,
        workflow: String,
        error: String,
    },
    AgentStarted {
        invocation: InvocationId,
        agent: String,
    },
    AgentCompleted {
        invocation: InvocationId,
        agent: String,
        output_key: String,
        output: Value,
    },
    AgentFailed {
        invocation: InvocationId,
        agent: String,
        error: String,
    },
    RetryScheduled {
        invocation: InvocationId,
        node: String,
        attempt: u32,
        error: String,
    },
    FallbackApplied {
        invocation: InvocationId,
        node: String,
        error: String,
    },
    BranchSelected {
        invocation: InvocationId,
        node: String,
        branch: usize,
        target: String,
    },
    LoopFinished {
        invocation: InvocationId,
        node: String,
        state: LoopState,
        iterations: usize,
    },
    SupervisorStep {
        invocation: InvocationId,
        node: String,
        step: usize,
        agent: String,
        succeeded: bool,
    },
    PlanComputed {
        invocation: InvocationId,
        node: String,
        steps: Vec<String>,
    },
    HumanInputRequested {
        invocation: InvocationId,
        node: String,
        request: Value,
    },
    HumanInputReceived {
        invocation: InvocationId,
        node: String,
        response: Value,
    },
}

impl WorkflowEvent {
    pub fn invocation(&self) -> InvocationId {
        match self {
            Self::InvocationStarted { invocation, .. }
            | Self::InvocationCompleted { invocation, .. }
            | Self::InvocationFailed { invocation, .. }
            | Self::AgentStarted { invocation, .. }
            | Self::AgentCompleted { invocation, .. }
            | Self::AgentFailed { invocation, .. }
            | Self::RetryScheduled { invocation, .. }
            | Self::FallbackApplied { invocation, .. }
            | Self::BranchSelected { invocation, .. }
            | Self::LoopFinished { invocation, .. }
            | Self::SupervisorStep { invocation, .. }
            | Self::PlanComputed { invocation, .. }
            | Self::HumanInputRequested { invocation, .. }
            | Self::HumanInputReceived { invocation, .. } => *invocation,
        }
    }
}
