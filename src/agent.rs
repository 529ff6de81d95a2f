//! Agent contract and the adapter that runs an agent as a workflow node

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::node::Node;
use crate::recovery::RecoveryPolicy;
use crate::scope::{AgentInvocation, Scope};

/// Shape of a JSON value, used to check declared agent outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Any,
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        *self == Self::Any || *self == Self::of(value)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// A named input an agent reads from the scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub key: String,
    /// Used when the key is absent; `None` makes the input required
    pub default: Option<Value>,
}

impl InputSpec {
    pub fn required(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            default: None,
        }
    }

    pub fn optional(key: impl Into<String>, default: Value) -> Self {
        Self {
            key: key.into(),
            default: Some(default),
        }
    }
}

/// Named arguments handed to an agent call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments(Map<String, Value>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Deserialize one argument
    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .0
            .get(key)
            .cloned()
            .ok_or_else(|| WorkflowError::KeyMissing(key.to_string()))?;
        serde_json::from_value(value).map_err(|source| WorkflowError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Arguments {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<Map<String, Value>> for Arguments {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl IntoIterator for Arguments {
    type Item = (String, Value);
    type IntoIter = serde_json::map::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// An opaque unit of work: named inputs in, one named output out.
///
/// Implementations hold no state across calls beyond what they are given.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn inputs(&self) -> &[InputSpec];

    fn output_key(&self) -> &str;

    fn output_kind(&self) -> ValueKind {
        ValueKind::Any
    }

    async fn call(&self, arguments: Arguments) -> anyhow::Result<Value>;
}

type AgentFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
type AgentFn = Arc<dyn Fn(Arguments) -> AgentFuture + Send + Sync>;

/// Agent backed by an async closure
#[derive(Clone)]
pub struct FnAgent {
    name: String,
    description: String,
    inputs: Vec<InputSpec>,
    output_key: String,
    output_kind: ValueKind,
    func: AgentFn,
}

impl FnAgent {
    pub fn new<F, Fut>(name: impl Into<String>, output_key: impl Into<String>, func: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            inputs: Vec::new(),
            output_key: output_key.into(),
            output_kind: ValueKind::Any,
            func: Arc::new(move |arguments| -> AgentFuture { Box::pin(func(arguments)) }),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input(mut self, key: impl Into<String>) -> Self {
        self.inputs.push(InputSpec::required(key));
        self
    }

    pub fn input_or(mut self, key: impl Into<String>, default: Value) -> Self {
        self.inputs.push(InputSpec::optional(key, default));
        self
    }

    pub fn with_output_kind(mut self, kind: ValueKind) -> Self {
        self.output_kind = kind;
        self
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn inputs(&self) -> &[InputSpec] {
        &self.inputs
    }

    fn output_key(&self) -> &str {
        &self.output_key
    }

    fn output_kind(&self) -> ValueKind {
        self.output_kind
    }

    async fn call(&self, arguments: Arguments) -> anyhow::Result<Value> {
        (self.func)(arguments).await
    }
}

impl fmt::Debug for FnAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAgent")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("output_key", &self.output_key)
            .finish()
    }
}

/// Runs an [`Agent`] against a scope: gathers its inputs, calls it, checks
/// the result and writes it under the agent's output key
#[derive(Clone)]
pub struct AgentNode {
    agent: Arc<dyn Agent>,
    recovery: RecoveryPolicy,
}

impl AgentNode {
    pub fn new(agent: impl Agent + 'static) -> Self {
        Self::from_arc(Arc::new(agent))
    }

    pub fn from_arc(agent: Arc<dyn Agent>) -> Self {
        Self {
            agent,
            recovery: RecoveryPolicy::Abort,
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn agent(&self) -> &dyn Agent {
        self.agent.as_ref()
    }

    async fn gather(&self, scope: &Scope) -> Result<Arguments> {
        let mut arguments = Arguments::new();
        for input in self.agent.inputs() {
            match (scope.wait_for(&input.key).await?, &input.default) {
                (Some(value), _) => arguments.insert(input.key.clone(), value),
                (None, Some(default)) => arguments.insert(input.key.clone(), default.clone()),
                (None, None) => {
                    return Err(WorkflowError::InputMissing {
                        agent: self.agent.name().to_string(),
                        key: input.key.clone(),
                    })
                }
            }
        }
        Ok(arguments)
    }
}

#[async_trait]
impl Node for AgentNode {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn description(&self) -> &str {
        self.agent.description()
    }

    fn inputs(&self) -> Vec<InputSpec> {
        self.agent.inputs().to_vec()
    }

    fn output_key(&self) -> Option<&str> {
        Some(self.agent.output_key())
    }

    fn recovery(&self) -> &RecoveryPolicy {
        &self.recovery
    }

    #[instrument(skip(self, scope), fields(agent = %self.agent.name(), invocation = %scope.id()))]
    async fn run(&self, scope: &Scope) -> Result<Option<Value>> {
        scope.check_cancelled()?;
        let name = self.agent.name().to_string();
        let arguments = self.gather(scope).await?;

        debug!(arguments = arguments.len(), "Calling agent");
        scope.emit(WorkflowEvent::AgentStarted {
            invocation: scope.id(),
            agent: name.clone(),
        });

        let cancel = scope.cancellation();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
            result = self.agent.call(arguments) => result,
        };
        let output = match result {
            Ok(output) => output,
            Err(source) => {
                warn!(error = %source, "Agent failed");
                scope.emit(WorkflowEvent::AgentFailed {
                    invocation: scope.id(),
                    agent: name.clone(),
                    error: source.to_string(),
                });
                return Err(WorkflowError::execution(name, source));
            }
        };

        let expected = self.agent.output_kind();
        if !expected.accepts(&output) {
            return Err(WorkflowError::OutputTypeMismatch {
                agent: name,
                key: self.agent.output_key().to_string(),
                expected,
                actual: ValueKind::of(&output),
            });
        }

        let key = self.agent.output_key().to_string();
        scope.write(key.clone(), output.clone());
        scope.record_invocation(AgentInvocation {
            agent: name.clone(),
            output_key: key.clone(),
            output: output.clone(),
        });
        scope.emit(WorkflowEvent::AgentCompleted {
            invocation: scope.id(),
            agent: name,
            output_key: key,
            output: output.clone(),
        });

        info!("Agent completed");
        Ok(Some(output))
    }
}

impl fmt::Debug for AgentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentNode")
            .field("agent", &self.agent.name())
            .field("recovery", &self.recovery)
            .finish()
    }
}
