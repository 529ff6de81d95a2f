//! Scope - the per-invocation shared state threaded through every node

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;

/// Identifies one top-level invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One recorded agent invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentInvocation {
    pub agent: String,
    pub output_key: String,
    pub output: Value,
}

/// State of a value that is still being produced outside the workflow
#[derive(Debug, Clone)]
pub(crate) enum Deferred {
    Waiting,
    Ready,
    Failed(String),
}

struct ScopeState {
    id: InvocationId,
    values: RwLock<HashMap<String, Value>>,
    /// Keys written through this scope, first write first
    written: Mutex<Vec<String>>,
    pending: Mutex<HashMap<String, watch::Receiver<Deferred>>>,
    journal: Mutex<Vec<AgentInvocation>>,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

/// Keyed state shared by every node of one invocation.
///
/// Cloning a `Scope` yields another handle to the same state. Concurrent
/// branches get their own working copy through [`Scope::fork`] and are
/// merged back with [`Scope::absorb`]; branches running in parallel are
/// expected to write disjoint keys.
#[derive(Clone)]
pub struct Scope {
    state: Arc<ScopeState>,
}

impl Scope {
    /// Create an empty scope for a fresh invocation
    pub fn new() -> Self {
        Self::build(InvocationId::new(), HashMap::new(), CancellationToken::new(), None)
    }

    /// Create a scope seeded with invocation arguments
    pub fn with_arguments<I, K>(arguments: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let scope = Self::new();
        for (key, value) in arguments {
            scope.write(key, value);
        }
        scope
    }

    /// Create an empty scope under a caller-chosen invocation id
    pub fn for_invocation(id: InvocationId) -> Self {
        Self::build(id, HashMap::new(), CancellationToken::new(), None)
    }

    fn build(
        id: InvocationId,
        values: HashMap<String, Value>,
        cancel: CancellationToken,
        events: Option<mpsc::UnboundedSender<WorkflowEvent>>,
    ) -> Self {
        Self {
            state: Arc::new(ScopeState {
                id,
                values: RwLock::new(values),
                written: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                journal: Mutex::new(Vec::new()),
                cancel,
                events,
            }),
        }
    }

    /// Attach an event sink; must be called before the scope is shared
    pub fn with_events(self, events: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        let values = self.state.values.read().clone();
        let scope = Self::build(self.state.id, values, self.state.cancel.clone(), Some(events));
        *scope.state.written.lock() = self.state.written.lock().clone();
        scope
    }

    /// Follow an externally owned cancellation token.
    ///
    /// The scope holds a child of `cancel`, so ending the invocation never
    /// cancels the caller's token.
    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        let values = self.state.values.read().clone();
        let scope = Self::build(
            self.state.id,
            values,
            cancel.child_token(),
            self.state.events.clone(),
        );
        *scope.state.written.lock() = self.state.written.lock().clone();
        scope
    }

    pub fn id(&self) -> InvocationId {
        self.state.id
    }

    /// Read a value, `None` if the key was never written
    pub fn read(&self, key: &str) -> Option<Value> {
        self.state.values.read().get(key).cloned()
    }

    /// Read a value or fall back to `default`
    pub fn read_or(&self, key: &str, default: Value) -> Value {
        self.read(key).unwrap_or(default)
    }

    /// Read and deserialize a value
    pub fn read_typed<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .read(key)
            .ok_or_else(|| WorkflowError::KeyMissing(key.to_string()))?;
        decode(key, value)
    }

    /// Read and deserialize a value, using `default` when the key is absent
    pub fn read_typed_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.read(key) {
            Some(value) => decode(key, value),
            None => Ok(default),
        }
    }

    /// Write a value, overwriting any previous one
    pub fn write(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        debug!(invocation = %self.state.id, key = %key, "Scope write");
        self.state.values.write().insert(key.clone(), value);
        let mut written = self.state.written.lock();
        if !written.contains(&key) {
            written.push(key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.values.read().contains_key(key)
    }

    /// All keys currently holding a value, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.values.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Immutable copy of the current values
    pub fn snapshot(&self) -> ScopeSnapshot {
        ScopeSnapshot {
            values: self.state.values.read().clone(),
        }
    }

    /// Agent invocations recorded so far, in completion order
    pub fn invocations(&self) -> Vec<AgentInvocation> {
        self.state.journal.lock().clone()
    }

    pub(crate) fn record_invocation(&self, invocation: AgentInvocation) {
        self.state.journal.lock().push(invocation);
    }

    /// Independent working copy for a concurrent branch
    pub fn fork(&self) -> Scope {
        let values = self.state.values.read().clone();
        Self::build(
            self.state.id,
            values,
            self.state.cancel.clone(),
            self.state.events.clone(),
        )
    }

    /// Like [`Scope::fork`], but the branch stops when `cancel` fires
    pub(crate) fn fork_under(&self, cancel: CancellationToken) -> Scope {
        let values = self.state.values.read().clone();
        Self::build(self.state.id, values, cancel, self.state.events.clone())
    }

    /// Copy back every key written in `branch`, plus its journal.
    ///
    /// Returns the keys that were already written by an earlier branch
    /// recorded in `seen`; those keys now hold this branch's value.
    pub fn absorb(&self, branch: &Scope, seen: &mut HashSet<String>) -> Vec<String> {
        let written = branch.state.written.lock().clone();
        let mut overlapping = Vec::new();
        for key in written {
            if let Some(value) = branch.read(&key) {
                if !seen.insert(key.clone()) {
                    overlapping.push(key.clone());
                }
                self.write(key, value);
            }
        }
        let journal = branch.state.journal.lock().clone();
        self.state.journal.lock().extend(journal);
        overlapping
    }

    /// Mark `key` as being produced asynchronously
    pub(crate) fn defer(&self, key: &str, progress: watch::Receiver<Deferred>) {
        self.state.pending.lock().insert(key.to_string(), progress);
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.state.pending.lock().contains_key(key)
    }

    /// Read `key`, first waiting for it if it is still being produced
    pub async fn wait_for(&self, key: &str) -> Result<Option<Value>> {
        let progress = self.state.pending.lock().get(key).cloned();
        if let Some(progress) = progress {
            self.await_deferred(key, progress).await?;
        }
        Ok(self.read(key))
    }

    /// Wait for every deferred value to arrive
    pub async fn settle(&self) -> Result<()> {
        loop {
            let next = self
                .state
                .pending
                .lock()
                .iter()
                .next()
                .map(|(key, progress)| (key.clone(), progress.clone()));
            match next {
                Some((key, progress)) => self.await_deferred(&key, progress).await?,
                None => return Ok(()),
            }
        }
    }

    async fn await_deferred(
        &self,
        key: &str,
        mut progress: watch::Receiver<Deferred>,
    ) -> Result<()> {
        let outcome = tokio::select! {
            _ = self.state.cancel.cancelled() => return Err(WorkflowError::Cancelled),
            outcome = progress.wait_for(|state| !matches!(state, Deferred::Waiting)) => outcome
                .map(|state| state.clone())
                .unwrap_or_else(|_| Deferred::Failed("response channel dropped".into())),
        };
        self.state.pending.lock().remove(key);
        match outcome {
            Deferred::Failed(reason) => Err(WorkflowError::HumanInput {
                key: key.to_string(),
                reason,
            }),
            _ => Ok(()),
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// Fail with `Cancelled` if the invocation has been cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        Ok(())
    }

    /// Emit an event to the attached sink, if any
    pub fn emit(&self, event: WorkflowEvent) {
        if let Some(events) = &self.state.events {
            if events.send(event).is_err() {
                warn!(invocation = %self.state.id, "Event receiver dropped");
            }
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.state.id)
            .field("keys", &self.keys())
            .finish()
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|source| WorkflowError::TypeMismatch {
        key: key.to_string(),
        expected: std::any::type_name::<T>(),
        source,
    })
}

/// Immutable view of a scope at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScopeSnapshot {
    values: HashMap<String, Value>,
}

impl ScopeSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| WorkflowError::KeyMissing(key.to_string()))?;
        decode(key, value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> HashMap<String, Value> {
        self.values
    }
}
