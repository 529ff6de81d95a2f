//! Conditional - first-match dispatch over predicate-guarded branches

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::node::{Node, NodeRef};
use crate::recovery::RecoveryPolicy;
use crate::scope::Scope;

/// Branch guard evaluated against the current scope
pub type Predicate = Arc<dyn Fn(&Scope) -> bool + Send + Sync>;

/// True when `key` holds exactly `expected`
pub fn key_equals(key: impl Into<String>, expected: Value) -> Predicate {
    let key = key.into();
    Arc::new(move |scope: &Scope| scope.read(&key).as_ref() == Some(&expected))
}

/// True when `key` holds any value
pub fn key_present(key: impl Into<String>) -> Predicate {
    let key = key.into();
    Arc::new(move |scope: &Scope| scope.contains(&key))
}

/// Always true; useful as a final catch-all branch
pub fn always() -> Predicate {
    Arc::new(|_: &Scope| true)
}

/// What happens when no predicate matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchPolicy {
    /// Fail with `NoBranchMatched`
    #[default]
    Fail,
    /// Leave the scope unchanged and return no output
    PassThrough,
}

struct Branch {
    predicate: Predicate,
    node: NodeRef,
}

/// Invokes the node of the first branch whose predicate holds
pub struct Conditional {
    name: String,
    description: String,
    branches: Vec<Branch>,
    no_match: NoMatchPolicy,
    output_key: Option<String>,
    recovery: RecoveryPolicy,
}

impl Conditional {
    pub fn builder() -> ConditionalBuilder {
        ConditionalBuilder::default()
    }

    /// Index of the branch that would run for this scope
    pub fn select(&self, scope: &Scope) -> Option<usize> {
        self.branches.iter().position(|branch| (branch.predicate)(scope))
    }
}

#[async_trait]
impl Node for Conditional {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    fn recovery(&self) -> &RecoveryPolicy {
        &self.recovery
    }

    #[instrument(skip(self, scope), fields(conditional = %self.name, invocation = %scope.id()))]
    async fn run(&self, scope: &Scope) -> Result<Option<Value>> {
        scope.settle().await?;

        let Some(index) = self.select(scope) else {
            return match self.no_match {
                NoMatchPolicy::Fail => Err(WorkflowError::NoBranchMatched {
                    node: self.name.clone(),
                }),
                NoMatchPolicy::PassThrough => {
                    warn!("No branch matched, passing scope through");
                    Ok(None)
                }
            };
        };

        let branch = &self.branches[index].node;
        info!(branch = index, target = %branch.name(), "Branch selected");
        scope.emit(WorkflowEvent::BranchSelected {
            invocation: scope.id(),
            node: self.name.clone(),
            branch: index,
            target: branch.name().to_string(),
        });

        let output = branch.invoke(scope).await?;
        debug!(branch = index, "Branch completed");

        match &self.output_key {
            Some(key) => Ok(scope.read(key)),
            None => Ok(output),
        }
    }
}

/// Builder for [`Conditional`]
#[derive(Default)]
pub struct ConditionalBuilder {
    name: Option<String>,
    description: String,
    branches: Vec<Branch>,
    no_match: NoMatchPolicy,
    output_key: Option<String>,
    recovery: RecoveryPolicy,
}

impl ConditionalBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a branch; branches are tried in the order they are added
    pub fn when<F>(mut self, predicate: F, node: impl Node + 'static) -> Self
    where
        F: Fn(&Scope) -> bool + Send + Sync + 'static,
    {
        self.branches.push(Branch {
            predicate: Arc::new(predicate),
            node: Arc::new(node),
        });
        self
    }

    pub fn branch(mut self, predicate: Predicate, node: NodeRef) -> Self {
        self.branches.push(Branch { predicate, node });
        self
    }

    pub fn no_match(mut self, policy: NoMatchPolicy) -> Self {
        self.no_match = policy;
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn build(self) -> Result<Conditional> {
        if self.branches.is_empty() {
            return Err(WorkflowError::ConfigError("conditional needs at least one branch".into()));
        }
        Ok(Conditional {
            name: self.name.unwrap_or_else(|| "conditional".to_string()),
            description: self.description,
            branches: self.branches,
            no_match: self.no_match,
            output_key: self.output_key,
            recovery: self.recovery,
        })
    }
}
