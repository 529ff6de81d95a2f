//! Workflow - the invocation entrypoint around a root node

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::agent::Arguments;
use crate::error::Result;
use crate::events::WorkflowEvent;
use crate::node::{Node, NodeRef};
use crate::scope::{AgentInvocation, InvocationId, Scope, ScopeSnapshot};

/// Outcome of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub id: InvocationId,
    pub output: Option<Value>,
    pub scope: ScopeSnapshot,
    pub invocations: Vec<AgentInvocation>,
}

/// A named composition ready to be invoked.
///
/// Every invocation gets a fresh [`Scope`]; the node tree itself is shared
/// and may serve concurrent invocations.
#[derive(Clone)]
pub struct Workflow {
    name: String,
    root: NodeRef,
    events: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, root: impl Node + 'static) -> Self {
        Self::from_node(name, Arc::new(root))
    }

    pub fn from_node(name: impl Into<String>, root: NodeRef) -> Self {
        Self {
            name: name.into(),
            root,
            events: None,
        }
    }

    /// Report progress of every invocation to `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    /// Run with `arguments` and return only the extracted value
    pub async fn invoke(&self, arguments: Arguments) -> Result<Option<Value>> {
        Ok(self.invoke_with_scope(arguments).await?.output)
    }

    /// Run with `arguments` and return the final scope as well
    pub async fn invoke_with_scope(&self, arguments: Arguments) -> Result<WorkflowResult> {
        self.run_scope(self.prepare(Scope::new(), arguments)).await
    }

    /// Run under an externally controlled cancellation token
    pub async fn invoke_with_cancel(
        &self,
        arguments: Arguments,
        cancel: CancellationToken,
    ) -> Result<WorkflowResult> {
        let scope = self.prepare(Scope::new(), arguments).with_cancellation(cancel);
        self.run_scope(scope).await
    }

    fn prepare(&self, scope: Scope, arguments: Arguments) -> Scope {
        for (key, value) in arguments {
            scope.write(key, value);
        }
        match &self.events {
            Some(events) => scope.with_events(events.clone()),
            None => scope,
        }
    }

    /// Run against a caller-built scope.
    ///
    /// The scope's token is cancelled once the invocation ends, which stops
    /// any work it left behind such as unanswered human requests.
    #[instrument(skip(self, scope), fields(workflow = %self.name, invocation = %scope.id()))]
    pub async fn run_scope(&self, scope: Scope) -> Result<WorkflowResult> {
        let _finished = scope.cancellation().drop_guard();
        info!("Invocation started");
        scope.emit(WorkflowEvent::InvocationStarted {
            invocation: scope.id(),
            workflow: self.name.clone(),
        });

        match self.execute(&scope).await {
            Ok(output) => {
                info!("Invocation completed");
                scope.emit(WorkflowEvent::InvocationCompleted {
                    invocation: scope.id(),
                    workflow: self.name.clone(),
                    output: output.clone(),
                });
                Ok(WorkflowResult {
                    id: scope.id(),
                    output,
                    scope: scope.snapshot(),
                    invocations: scope.invocations(),
                })
            }
            Err(err) => {
                error!(error = %err, "Invocation failed");
                scope.emit(WorkflowEvent::InvocationFailed {
                    invocation: scope.id(),
                    workflow: self.name.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn execute(&self, scope: &Scope) -> Result<Option<Value>> {
        let returned = self.root.invoke(scope).await?;
        scope.settle().await?;
        Ok(match self.root.output_key() {
            Some(key) => scope.read(key).or(returned),
            None => returned,
        })
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("root", &self.root.name())
            .finish()
    }
}
