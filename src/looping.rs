//! Loop - repeated execution of a body until an exit condition or a cap

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::node::{Node, NodeRef, OutputFn, OutputSpec};
use crate::recovery::RecoveryPolicy;
use crate::scope::{Scope, ScopeSnapshot};
use crate::sequence::Sequence;

/// Exit condition checked after every full iteration
pub type ExitCondition = Arc<dyn Fn(&Scope) -> bool + Send + Sync>;

/// Loop state machine; `Exited` and `MaxIterationsReached` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Running,
    Exited,
    MaxIterationsReached,
}

/// Whether hitting the iteration cap is a normal ending or an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapPolicy {
    #[default]
    Complete,
    Fail,
}

/// How a loop run ended
#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    pub state: LoopState,
    pub iterations: usize,
    pub output: Option<Value>,
}

impl LoopReport {
    pub fn converged(&self) -> bool {
        self.state == LoopState::Exited
    }
}

/// Re-runs its body against the evolving scope
pub struct Loop {
    name: String,
    description: String,
    body: NodeRef,
    max_iterations: usize,
    exit_condition: Option<ExitCondition>,
    cap_policy: CapPolicy,
    output: OutputSpec,
    recovery: RecoveryPolicy,
}

impl Loop {
    pub fn builder() -> LoopBuilder {
        LoopBuilder::default()
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Run to a terminal state and report which one was reached.
    ///
    /// Unlike [`Node::invoke`] this never turns the cap into an error, so
    /// callers can tell a converged loop from an exhausted one.
    pub async fn iterate(&self, scope: &Scope) -> Result<LoopReport> {
        let mut state = LoopState::Running;
        let mut iterations = 0;

        while state == LoopState::Running {
            scope.check_cancelled()?;
            iterations += 1;
            debug!(iteration = iterations, "Starting loop iteration");
            self.body.invoke(scope).await?;
            scope.settle().await?;

            let exit = self.exit_condition.as_ref().is_some_and(|exit| exit(scope));
            if exit {
                state = LoopState::Exited;
            } else if iterations >= self.max_iterations {
                state = LoopState::MaxIterationsReached;
            }
        }

        match state {
            LoopState::Exited => info!(iterations, "Loop exit condition met"),
            _ => warn!(iterations, "Loop reached its iteration cap"),
        }
        scope.emit(WorkflowEvent::LoopFinished {
            invocation: scope.id(),
            node: self.name.clone(),
            state,
            iterations,
        });

        let output = self.output.resolve(&self.name, scope)?;
        Ok(LoopReport {
            state,
            iterations,
            output,
        })
    }
}

#[async_trait]
impl Node for Loop {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn output_key(&self) -> Option<&str> {
        self.output.key()
    }

    fn recovery(&self) -> &RecoveryPolicy {
        &self.recovery
    }

    #[instrument(skip(self, scope), fields(node = %self.name, invocation = %scope.id()))]
    async fn run(&self, scope: &Scope) -> Result<Option<Value>> {
        let report = self.iterate(scope).await?;
        if report.state == LoopState::MaxIterationsReached && self.cap_policy == CapPolicy::Fail {
            return Err(WorkflowError::MaxIterationsReached {
                node: self.name.clone(),
                iterations: report.iterations,
            });
        }
        Ok(report.output)
    }
}

/// Builder for [`Loop`]
#[derive(Default)]
pub struct LoopBuilder {
    name: Option<String>,
    description: String,
    body: Vec<NodeRef>,
    max_iterations: Option<usize>,
    exit_condition: Option<ExitCondition>,
    cap_policy: CapPolicy,
    output: OutputSpec,
    recovery: RecoveryPolicy,
}

impl LoopBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a node to the loop body; several nodes run as a sequence
    pub fn step(mut self, node: impl Node + 'static) -> Self {
        self.body.push(Arc::new(node));
        self
    }

    pub fn sub_agents(mut self, nodes: impl IntoIterator<Item = NodeRef>) -> Self {
        self.body.extend(nodes);
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn exit_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Scope) -> bool + Send + Sync + 'static,
    {
        self.exit_condition = Some(Arc::new(condition));
        self
    }

    pub fn cap_policy(mut self, policy: CapPolicy) -> Self {
        self.cap_policy = policy;
        self
    }

    pub fn configure(mut self, config: &EngineConfig) -> Self {
        if self.max_iterations.is_none() {
            self.max_iterations = Some(config.max_iterations);
        }
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output.key = Some(key.into());
        self
    }

    pub fn output<F>(mut self, extract: F) -> Self
    where
        F: Fn(&ScopeSnapshot) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let extract: OutputFn = Arc::new(extract);
        self.output.extract = Some(extract);
        self
    }

    pub fn recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn build(mut self) -> Result<Loop> {
        let name = self.name.unwrap_or_else(|| "loop".to_string());
        let max_iterations = self
            .max_iterations
            .unwrap_or_else(|| EngineConfig::default().max_iterations);
        if max_iterations == 0 {
            return Err(WorkflowError::ConfigError("max_iterations must be positive".into()));
        }

        let body: NodeRef = match self.body.len() {
            0 => return Err(WorkflowError::ConfigError("loop needs a body".into())),
            1 => self.body.remove(0),
            _ => Arc::new(
                Sequence::builder()
                    .name(format!("{}-body", name))
                    .sub_agents(self.body)
                    .build()?,
            ),
        };

        Ok(Loop {
            name,
            description: self.description,
            body,
            max_iterations,
            exit_condition: self.exit_condition,
            cap_policy: self.cap_policy,
            output: self.output,
            recovery: self.recovery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentNode, Arguments, FnAgent};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_scorer(calls: Arc<AtomicUsize>, step: f64) -> AgentNode {
        AgentNode::new(
            FnAgent::new("style-scorer", "score", move |args: Arguments| {
                calls.fetch_add(1, Ordering::SeqCst);
                let score = args.get_typed::<f64>("score").unwrap_or(0.0);
                async move { Ok(json!(score + step)) }
            })
            .input_or("score", json!(0.0)),
        )
    }

    #[tokio::test]
    async fn test_exits_when_condition_holds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let review = Loop::builder()
            .name("style-review")
            .step(counting_scorer(Arc::clone(&calls), 0.25))
            .max_iterations(5)
            .exit_condition(|scope| scope.read_typed_or("score", 0.0).unwrap_or(0.0) >= 0.75)
            .output_key("score")
            .build()
            .unwrap();

        let report = review.iterate(&Scope::new()).await.unwrap();
        assert_eq!(report.state, LoopState::Exited);
        assert!(report.converged());
        assert_eq!(report.iterations, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.output, Some(json!(0.75)));
    }

    #[tokio::test]
    async fn test_cap_reached_without_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let review = Loop::builder()
            .step(counting_scorer(Arc::clone(&calls), 0.1))
            .max_iterations(5)
            .exit_condition(|_| false)
            .build()
            .unwrap();

        let scope = Scope::new();
        let report = review.iterate(&scope).await.unwrap();
        assert_eq!(report.state, LoopState::MaxIterationsReached);
        assert_eq!(report.iterations, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        calls.store(0, Ordering::SeqCst);
        assert!(review.invoke(&Scope::new()).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_cap_as_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let review = Loop::builder()
            .name("stubborn")
            .step(counting_scorer(Arc::clone(&calls), 0.1))
            .max_iterations(2)
            .cap_policy(CapPolicy::Fail)
            .build()
            .unwrap();

        let err = review.invoke(&Scope::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::MaxIterationsReached { iterations: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_condition_checked_after_whole_iteration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let editor_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&editor_calls);
        let editor = AgentNode::new(FnAgent::new("style-editor", "story", move |_args| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!("edited")) }
        }));

        let review = Loop::builder()
            .step(counting_scorer(Arc::clone(&calls), 1.0))
            .step(editor)
            .exit_condition(|scope| scope.contains("score"))
            .build()
            .unwrap();

        let report = review.iterate(&Scope::new()).await.unwrap();
        assert_eq!(report.iterations, 1);
        assert_eq!(editor_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configured_default_cap() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = EngineConfig { max_iterations: 3, ..Default::default() };
        let review = Loop::builder()
            .step(counting_scorer(Arc::clone(&calls), 0.1))
            .configure(&config)
            .build()
            .unwrap();
        assert_eq!(review.max_iterations(), 3);

        let unconfigured = Loop::builder().step(counting_scorer(calls, 0.1)).build().unwrap();
        assert_eq!(unconfigured.max_iterations(), 5);
    }

    #[tokio::test]
    async fn test_body_failure_propagates() {
        let failing = AgentNode::new(FnAgent::new("broken", "x", |_args| async {
            Err(anyhow::anyhow!("boom"))
        }));
        let review = Loop::builder().step(failing).build().unwrap();
        assert!(matches!(
            review.invoke(&Scope::new()).await,
            Err(WorkflowError::ExecutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_cap_failure_recovered_by_own_fallback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let review = Loop::builder()
            .name("stubborn")
            .step(counting_scorer(Arc::clone(&calls), 0.1))
            .max_iterations(2)
            .exit_condition(|_| false)
            .cap_policy(CapPolicy::Fail)
            .output_key("verdict")
            .recovery(RecoveryPolicy::fallback_value(json!("gave up")))
            .build()
            .unwrap();

        let scope = Scope::new();
        assert_eq!(review.invoke(&scope).await.unwrap(), Some(json!("gave up")));
        assert_eq!(scope.read("verdict"), Some(json!("gave up")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
