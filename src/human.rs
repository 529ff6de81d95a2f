//! Human-in-the-loop - pausing a workflow on an external response
//!
//! The node publishes a request built from one scope key and stores the
//! response under another. In async mode the workflow keeps going and the
//! response key is marked pending until the human answers; the first node
//! that reads it waits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::InputSpec;
use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::node::Node;
use crate::recovery::{Fallback, RecoveryPolicy};
use crate::scope::{Deferred, InvocationId, Scope};

/// A question put to a human
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanRequest {
    pub id: Uuid,
    pub invocation: InvocationId,
    pub node: String,
    pub input_key: String,
    pub request: Value,
}

/// Transport between a workflow and the human answering it
#[async_trait]
pub trait HumanChannel: Send + Sync {
    /// Present the request
    async fn publish(&self, request: &HumanRequest) -> anyhow::Result<()>;

    /// Wait for the answer to a published request
    async fn await_response(&self, request: &HumanRequest) -> anyhow::Result<Value>;
}

type Waiters = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Value>>>>;

/// In-process channel; the host answers through the paired [`HumanQueue`]
pub struct QueueChannel {
    requests: mpsc::UnboundedSender<HumanRequest>,
    waiters: Waiters,
    responses: Mutex<HashMap<Uuid, oneshot::Receiver<Value>>>,
}

/// Host side of a [`QueueChannel`]
pub struct HumanQueue {
    requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<HumanRequest>>,
    waiters: Waiters,
}

impl QueueChannel {
    pub fn open() -> (Self, HumanQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        (
            Self {
                requests: tx,
                waiters: Arc::clone(&waiters),
                responses: Mutex::new(HashMap::new()),
            },
            HumanQueue {
                requests: tokio::sync::Mutex::new(rx),
                waiters,
            },
        )
    }
}

#[async_trait]
impl HumanChannel for QueueChannel {
    async fn publish(&self, request: &HumanRequest) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request.id, tx);
        self.responses.lock().insert(request.id, rx);
        if self.requests.send(request.clone()).is_err() {
            self.waiters.lock().remove(&request.id);
            self.responses.lock().remove(&request.id);
            anyhow::bail!("nobody is listening for human requests");
        }
        Ok(())
    }

    async fn await_response(&self, request: &HumanRequest) -> anyhow::Result<Value> {
        let rx = self
            .responses
            .lock()
            .remove(&request.id)
            .ok_or_else(|| anyhow::anyhow!("request {} was never published", request.id))?;
        let _open = OpenRequest {
            waiters: &self.waiters,
            id: request.id,
        };
        rx.await
            .map_err(|_| anyhow::anyhow!("request {} was dropped unanswered", request.id))
    }
}

/// Closes the host-side entry of a request once nobody waits for it
struct OpenRequest<'a> {
    waiters: &'a Waiters,
    id: Uuid,
}

impl Drop for OpenRequest<'_> {
    fn drop(&mut self) {
        self.waiters.lock().remove(&self.id);
    }
}

impl HumanQueue {
    /// Next published request, `None` once the channel is gone
    pub async fn next_request(&self) -> Option<HumanRequest> {
        self.requests.lock().await.recv().await
    }

    pub fn respond(&self, id: Uuid, response: Value) -> Result<()> {
        let waiter = self
            .waiters
            .lock()
            .remove(&id)
            .ok_or_else(|| WorkflowError::ChannelError(format!("no open request {}", id)))?;
        waiter.send(response).map_err(|_| {
            WorkflowError::ChannelError(format!("request {} is no longer awaited", id))
        })
    }

    /// Wait for the next request and answer it
    pub async fn answer_next(&self, response: Value) -> Result<HumanRequest> {
        let request = self
            .next_request()
            .await
            .ok_or_else(|| WorkflowError::ChannelError("human channel closed".into()))?;
        self.respond(request.id, response)?;
        Ok(request)
    }

    /// Drop an open request; its waiter sees a failure
    pub fn reject(&self, id: Uuid) -> bool {
        self.waiters.lock().remove(&id).is_some()
    }
}

/// Terminal channel: prints the request and reads one line from stdin.
///
/// The stdin read runs on a blocking thread and cannot be interrupted, so a
/// cancelled request still consumes the next line typed.
#[derive(Debug, Clone)]
pub struct ConsoleChannel {
    prompt: String,
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self {
            prompt: ">>> ".to_string(),
        }
    }

    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HumanChannel for ConsoleChannel {
    async fn publish(&self, request: &HumanRequest) -> anyhow::Result<()> {
        let text = match &request.request {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other)?,
        };
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{}\n{}", text, self.prompt).as_bytes())
            .await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn await_response(&self, _request: &HumanRequest) -> anyhow::Result<Value> {
        let line = tokio::task::spawn_blocking(|| -> std::io::Result<String> {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok(line)
        })
        .await??;
        Ok(Value::String(line.trim_end().to_string()))
    }
}

/// Whether the workflow blocks on the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanMode {
    #[default]
    Sync,
    Async,
}

/// Handle on an answer that has not arrived yet
#[derive(Debug)]
pub struct PendingResponse {
    key: String,
    scope: Scope,
    progress: watch::Receiver<Deferred>,
}

impl PendingResponse {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.progress.borrow(), Deferred::Ready)
    }

    /// Wait for the answer and return it
    pub async fn wait(self) -> Result<Value> {
        self.scope
            .wait_for(&self.key)
            .await?
            .ok_or_else(|| WorkflowError::KeyMissing(self.key.clone()))
    }
}

/// Node that asks a human and records the answer
pub struct HumanInTheLoop {
    name: String,
    description: String,
    input_key: String,
    output_key: String,
    inputs: Vec<InputSpec>,
    channel: Arc<dyn HumanChannel>,
    mode: HumanMode,
    recovery: RecoveryPolicy,
}

impl HumanInTheLoop {
    pub fn builder() -> HumanInTheLoopBuilder {
        HumanInTheLoopBuilder::default()
    }

    pub fn mode(&self) -> HumanMode {
        self.mode
    }

    fn failure(&self, reason: impl ToString) -> WorkflowError {
        WorkflowError::HumanInput {
            key: self.output_key.clone(),
            reason: reason.to_string(),
        }
    }

    async fn publish(&self, scope: &Scope) -> Result<HumanRequest> {
        scope.check_cancelled()?;
        let request = scope
            .wait_for(&self.input_key)
            .await?
            .ok_or_else(|| WorkflowError::InputMissing {
                agent: self.name.clone(),
                key: self.input_key.clone(),
            })?;
        let request = HumanRequest {
            id: Uuid::new_v4(),
            invocation: scope.id(),
            node: self.name.clone(),
            input_key: self.input_key.clone(),
            request,
        };

        self.channel
            .publish(&request)
            .await
            .map_err(|err| self.failure(err))?;
        scope.emit(WorkflowEvent::HumanInputRequested {
            invocation: scope.id(),
            node: self.name.clone(),
            request: request.request.clone(),
        });
        debug!(request = %request.id, "Human request published");
        Ok(request)
    }

    fn record(scope: &Scope, node: &str, key: &str, response: &Value) {
        scope.write(key.to_string(), response.clone());
        scope.emit(WorkflowEvent::HumanInputReceived {
            invocation: scope.id(),
            node: node.to_string(),
            response: response.clone(),
        });
    }

    /// Publish the request and return immediately.
    ///
    /// The output key is pending in `scope` until the answer arrives. A
    /// missing answer goes through this node's recovery policy before the
    /// key is marked as failed.
    pub async fn request(&self, scope: &Scope) -> Result<PendingResponse> {
        let request = self.publish(scope).await?;
        let (tx, rx) = watch::channel(Deferred::Waiting);
        scope.defer(&self.output_key, rx.clone());

        let responder = Responder {
            channel: Arc::clone(&self.channel),
            scope: scope.clone(),
            node: self.name.clone(),
            key: self.output_key.clone(),
            recovery: self.recovery.clone(),
        };
        tokio::spawn(async move {
            let state = responder.resolve(request).await;
            let _ = tx.send(state);
        });

        Ok(PendingResponse {
            key: self.output_key.clone(),
            scope: scope.clone(),
            progress: rx,
        })
    }
}

/// Background half of an async request
struct Responder {
    channel: Arc<dyn HumanChannel>,
    scope: Scope,
    node: String,
    key: String,
    recovery: RecoveryPolicy,
}

impl Responder {
    async fn receive(&self, request: &HumanRequest) -> anyhow::Result<Value> {
        let cancel = self.scope.cancellation();
        tokio::select! {
            _ = cancel.cancelled() => Err(anyhow::anyhow!("invocation cancelled")),
            response = self.channel.await_response(request) => response,
        }
    }

    /// Ask again under a fresh request id
    async fn republish(&self, first: &HumanRequest) -> anyhow::Result<HumanRequest> {
        let request = HumanRequest {
            id: Uuid::new_v4(),
            ..first.clone()
        };
        self.channel.publish(&request).await?;
        self.scope.emit(WorkflowEvent::HumanInputRequested {
            invocation: self.scope.id(),
            node: self.node.clone(),
            request: request.request.clone(),
        });
        Ok(request)
    }

    async fn resolve(self, first: HumanRequest) -> Deferred {
        let err = match self.receive(&first).await {
            Ok(response) => return self.answered(&response),
            Err(err) => err,
        };
        if self.scope.is_cancelled() {
            return self.failed(err);
        }

        match &self.recovery {
            RecoveryPolicy::Abort => self.failed(err),
            RecoveryPolicy::Retry { attempts, backoff } => {
                let mut last = err;
                for attempt in 1..=*attempts {
                    warn!(node = %self.node, attempt, error = %last, "Asking human again");
                    self.scope.emit(WorkflowEvent::RetryScheduled {
                        invocation: self.scope.id(),
                        node: self.node.clone(),
                        attempt,
                        error: last.to_string(),
                    });
                    if !backoff.is_zero() {
                        tokio::time::sleep(*backoff).await;
                    }
                    if self.scope.is_cancelled() {
                        return self.failed(last);
                    }
                    let outcome = match self.republish(&first).await {
                        Ok(request) => self.receive(&request).await,
                        Err(err) => Err(err),
                    };
                    match outcome {
                        Ok(response) => return self.answered(&response),
                        Err(err) if self.scope.is_cancelled() => return self.failed(err),
                        Err(err) => last = err,
                    }
                }
                self.failed(last)
            }
            RecoveryPolicy::Fallback(fallback) => {
                warn!(node = %self.node, error = %err, "Applying fallback to human response");
                self.scope.emit(WorkflowEvent::FallbackApplied {
                    invocation: self.scope.id(),
                    node: self.node.clone(),
                    error: err.to_string(),
                });
                let value = match fallback {
                    Fallback::Value(value) => Some(value.clone()),
                    Fallback::Node(alternate) => match alternate.invoke(&self.scope).await {
                        Ok(value) => value,
                        Err(err) => return self.failed(err),
                    },
                };
                if let Some(value) = value {
                    self.scope.write(self.key.clone(), value);
                }
                Deferred::Ready
            }
        }
    }

    fn answered(&self, response: &Value) -> Deferred {
        info!(node = %self.node, key = %self.key, "Human response received");
        HumanInTheLoop::record(&self.scope, &self.node, &self.key, response);
        Deferred::Ready
    }

    fn failed(&self, err: impl std::fmt::Display) -> Deferred {
        warn!(node = %self.node, error = %err, "Human response failed");
        Deferred::Failed(err.to_string())
    }
}

#[async_trait]
impl Node for HumanInTheLoop {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn inputs(&self) -> Vec<InputSpec> {
        self.inputs.clone()
    }

    fn output_key(&self) -> Option<&str> {
        Some(&self.output_key)
    }

    fn recovery(&self) -> &RecoveryPolicy {
        &self.recovery
    }

    #[instrument(
        skip(self, scope),
        fields(node = %self.name, mode = ?self.mode, invocation = %scope.id())
    )]
    async fn run(&self, scope: &Scope) -> Result<Option<Value>> {
        if self.mode == HumanMode::Async {
            self.request(scope).await?;
            return Ok(None);
        }

        let request = self.publish(scope).await?;
        let cancel = scope.cancellation();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
            response = self.channel.await_response(&request) => {
                response.map_err(|err| self.failure(err))?
            }
        };
        Self::record(scope, &self.name, &self.output_key, &response);
        info!("Human response received");
        Ok(Some(response))
    }
}

/// Builder for [`HumanInTheLoop`]
#[derive(Default)]
pub struct HumanInTheLoopBuilder {
    name: Option<String>,
    description: String,
    input_key: Option<String>,
    output_key: Option<String>,
    channel: Option<Arc<dyn HumanChannel>>,
    mode: HumanMode,
    recovery: RecoveryPolicy,
}

impl HumanInTheLoopBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Scope key whose value is shown to the human
    pub fn input_key(mut self, key: impl Into<String>) -> Self {
        self.input_key = Some(key.into());
        self
    }

    /// Scope key the answer is stored under
    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn channel(mut self, channel: impl HumanChannel + 'static) -> Self {
        self.channel = Some(Arc::new(channel));
        self
    }

    pub fn mode(mut self, mode: HumanMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn build(self) -> Result<HumanInTheLoop> {
        let missing =
            |what: &str| WorkflowError::ConfigError(format!("human-in-the-loop needs {}", what));
        let input_key = self.input_key.ok_or_else(|| missing("an input key"))?;
        let output_key = self.output_key.ok_or_else(|| missing("an output key"))?;
        let channel = self.channel.ok_or_else(|| missing("a channel"))?;
        Ok(HumanInTheLoop {
            name: self.name.unwrap_or_else(|| "human".to_string()),
            description: self.description,
            inputs: vec![InputSpec::required(input_key.clone())],
            input_key,
            output_key,
            channel,
            mode: self.mode,
            recovery: self.recovery,
        })
    }
}
