//! Main orchestrator - serves registered workflows over a channel

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::Arguments;
use crate::channel::{ChannelPair, EngineChannel, Op};
use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::scope::{InvocationId, Scope};
use crate::workflow::Workflow;

type Running = Arc<Mutex<HashMap<InvocationId, CancellationToken>>>;

/// The workflow orchestrator
///
/// Holds a registry of named workflows and runs each requested invocation
/// on its own task, reporting progress as [`WorkflowEvent`]s.
pub struct Orchestrator {
    /// Registered workflows
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    /// Cancellation handles of running invocations
    running: Running,
    /// Channel for receiving operations
    op_rx: mpsc::UnboundedReceiver<Op>,
    /// Channel for sending events
    event_tx: mpsc::UnboundedSender<WorkflowEvent>,
    tasks: JoinSet<()>,
}

impl Orchestrator {
    /// Create a new orchestrator with the given channel pair
    pub fn new(channels: ChannelPair) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
            op_rx: channels.op_rx,
            event_tx: channels.event_tx,
            tasks: JoinSet::new(),
        }
    }

    /// Create an orchestrator and return a channel for communication
    pub fn with_channel() -> (Self, EngineChannel) {
        let (channel, pair) = EngineChannel::new();
        (Self::new(pair), channel)
    }

    /// Register a workflow under its name, replacing any previous one
    pub fn register(&self, workflow: Workflow) {
        let name = workflow.name().to_string();
        if self.workflows.write().insert(name.clone(), Arc::new(workflow)).is_some() {
            warn!(workflow = %name, "Replaced registered workflow");
        }
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().get(name).cloned()
    }

    /// Names of all registered workflows, sorted
    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Ids of invocations still running
    pub fn running(&self) -> Vec<InvocationId> {
        self.running.lock().keys().copied().collect()
    }

    /// Run the orchestrator event loop
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        info!("Starting workflow orchestrator");

        while let Some(op) = self.op_rx.recv().await {
            if matches!(op, Op::Shutdown) {
                info!("Shutdown requested");
                self.cancel_all();
                break;
            }
            if let Err(e) = self.handle_op(op) {
                error!(error = %e, "Error handling operation");
            }
        }

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Invocation task panicked");
            }
        }

        info!("Workflow orchestrator stopped");
        Ok(())
    }

    /// Handle a single operation
    fn handle_op(&mut self, op: Op) -> Result<()> {
        match op {
            Op::Invoke {
                invocation,
                workflow,
                arguments,
            } => self.start(invocation, &workflow, arguments),
            Op::Cancel { invocation } => self.cancel(invocation),
            Op::Shutdown => {
                self.cancel_all();
                Ok(())
            }
        }
    }

    /// Start an invocation on its own task
    fn start(&mut self, invocation: InvocationId, name: &str, arguments: Arguments) -> Result<()> {
        let Some(workflow) = self.workflow(name) else {
            let _ = self.event_tx.send(WorkflowEvent::InvocationFailed {
                invocation,
                workflow: name.to_string(),
                error: WorkflowError::WorkflowNotFound(name.to_string()).to_string(),
            });
            return Err(WorkflowError::WorkflowNotFound(name.to_string()));
        };

        let cancel = CancellationToken::new();
        self.running.lock().insert(invocation, cancel.clone());

        let scope = Scope::for_invocation(invocation)
            .with_events(self.event_tx.clone())
            .with_cancellation(cancel);
        for (key, value) in arguments {
            scope.write(key, value);
        }

        let running = Arc::clone(&self.running);
        self.tasks.spawn(async move {
            // Failures are reported through the event channel
            let _ = workflow.run_scope(scope).await;
            running.lock().remove(&invocation);
        });

        debug!(invocation = %invocation, workflow = %name, "Invocation started");
        Ok(())
    }

    fn cancel(&self, invocation: InvocationId) -> Result<()> {
        match self.running.lock().get(&invocation) {
            Some(token) => {
                token.cancel();
                info!(invocation = %invocation, "Invocation cancelled");
                Ok(())
            }
            None => Err(WorkflowError::ChannelError(format!(
                "no running invocation {}",
                invocation
            ))),
        }
    }

    fn cancel_all(&self) {
        for token in self.running.lock().values() {
            token.cancel();
        }
    }
}
