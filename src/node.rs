//! The uniform node contract shared by agents and combinators

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::agent::InputSpec;
use crate::error::{Result, WorkflowError};
use crate::recovery::{self, RecoveryPolicy};
use crate::scope::{Scope, ScopeSnapshot};

/// A workflow element.
///
/// Nodes are configuration objects built once and reused across
/// invocations; per-call state lives in the [`Scope`].
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    /// Capability description offered to supervisors and planners
    fn description(&self) -> &str {
        ""
    }

    /// Scope keys this node reads
    fn inputs(&self) -> Vec<InputSpec> {
        Vec::new()
    }

    /// Scope key this node writes its result under
    fn output_key(&self) -> Option<&str>;

    fn recovery(&self) -> &RecoveryPolicy;

    /// Execute once, without recovery
    async fn run(&self, scope: &Scope) -> Result<Option<Value>>;

    /// Execute, resolving failures through the node's recovery descriptor
    async fn invoke(&self, scope: &Scope) -> Result<Option<Value>> {
        recovery::resolve(self, scope).await
    }

    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            inputs: self.inputs().into_iter().map(|input| input.key).collect(),
            output_key: self.output_key().map(str::to_string),
        }
    }
}

pub type NodeRef = Arc<dyn Node>;

/// Static description of a node, as seen by delegation strategies
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub description: String,
    pub inputs: Vec<String>,
    pub output_key: Option<String>,
}

/// Computes a combinator's result from the scope once its children ran
pub type OutputFn = Arc<dyn Fn(&ScopeSnapshot) -> anyhow::Result<Value> + Send + Sync>;

/// How a combinator narrows the scope to its result
#[derive(Clone, Default)]
pub struct OutputSpec {
    pub key: Option<String>,
    pub extract: Option<OutputFn>,
}

impl OutputSpec {
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Compute the result: run the extraction function and store its value
    /// under the key, or read the key as left by the children
    pub(crate) fn resolve(&self, node: &str, scope: &Scope) -> Result<Option<Value>> {
        match &self.extract {
            Some(extract) => {
                let value = extract(&scope.snapshot())
                    .map_err(|source| WorkflowError::execution(node, source))?;
                if let Some(key) = &self.key {
                    scope.write(key.clone(), value.clone());
                }
                Ok(Some(value))
            }
            None => Ok(self.key.as_deref().and_then(|key| scope.read(key))),
        }
    }
}

impl std::fmt::Debug for OutputSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSpec")
            .field("key", &self.key)
            .field("extract", &self.extract.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_key_only_reads() {
        let scope = Scope::with_arguments([("story", json!("once upon a time"))]);
        let spec = OutputSpec { key: Some("story".into()), extract: None };
        assert_eq!(spec.resolve("seq", &scope).unwrap(), Some(json!("once upon a time")));
    }

    #[test]
    fn test_extract_writes_under_key() {
        let scope = Scope::with_arguments([("a", json!(2)), ("b", json!(3))]);
        let spec = OutputSpec {
            key: Some("sum".into()),
            extract: Some(Arc::new(|snapshot: &ScopeSnapshot| {
                Ok(json!(snapshot.get_typed::<i64>("a")? + snapshot.get_typed::<i64>("b")?))
            })),
        };
        assert_eq!(spec.resolve("seq", &scope).unwrap(), Some(json!(5)));
        assert_eq!(scope.read("sum"), Some(json!(5)));
    }

    #[test]
    fn test_extract_failure_is_execution_error() {
        let scope = Scope::new();
        let spec = OutputSpec {
            key: None,
            extract: Some(Arc::new(|snapshot: &ScopeSnapshot| {
                Ok(json!(snapshot.get_typed::<i64>("missing")?))
            })),
        };
        let err = spec.resolve("seq", &scope).unwrap_err();
        assert!(matches!(err, WorkflowError::ExecutionFailed { ref node, .. } if node == "seq"));
    }

    #[test]
    fn test_empty_spec_yields_nothing() {
        let scope = Scope::with_arguments([("x", json!(1))]);
        assert_eq!(OutputSpec::default().resolve("seq", &scope).unwrap(), None);
    }
}
