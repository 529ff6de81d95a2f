//! Supervisor - dynamic delegation among registered sub-agents
//!
//! The supervisor owns the loop only: ask the delegation strategy which
//! agent to run next and with what arguments, run it, fold the observation
//! into the context, repeat until the strategy says it is done or the step
//! cap is reached. How the choice is made is up to the strategy.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::agent::Arguments;
use crate::config::EngineConfig;
use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::node::{Node, NodeDescriptor, NodeRef};
use crate::recovery::RecoveryPolicy;
use crate::scope::Scope;

/// How observations are folded into the context the strategy sees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Every step so far
    #[default]
    FullHistory,
    /// A running summary plus the latest step
    Summarization,
    /// Every step plus a running summary
    FullHistoryAndSummarization,
}

impl ContextStrategy {
    fn summarizes(&self) -> bool {
        !matches!(self, Self::FullHistory)
    }
}

/// What the supervisor returns once the task is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStrategy {
    /// The last successful sub-agent output, verbatim
    #[default]
    Last,
    /// A final answer synthesized from the accumulated context
    Summary,
}

/// Result of one delegated step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed { output: Value },
    Failed { error: String },
}

/// One delegation and what came of it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorStep {
    pub index: usize,
    pub agent: String,
    pub arguments: Arguments,
    pub outcome: StepOutcome,
}

impl SupervisorStep {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, StepOutcome::Completed { .. })
    }
}

/// Everything the strategy may base its next decision on
#[derive(Debug)]
pub struct DelegationRequest<'a> {
    pub task: &'a str,
    /// Fixed policy text, passed unchanged on every step
    pub supervisor_context: Option<&'a str>,
    pub agents: &'a [NodeDescriptor],
    pub history: &'a [SupervisorStep],
    pub summary: Option<&'a str>,
}

/// The strategy's decision
#[derive(Debug, Clone, PartialEq)]
pub enum Delegation {
    Invoke { agent: String, arguments: Arguments },
    Done { response: Option<String> },
}

/// Chooses the next sub-agent and synthesizes its input
#[async_trait]
pub trait DelegationStrategy: Send + Sync {
    async fn decide(&self, request: &DelegationRequest<'_>) -> anyhow::Result<Delegation>;
}

/// Compresses supervisor context and synthesizes final answers
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize_context(
        &self,
        task: &str,
        previous: Option<&str>,
        step: &SupervisorStep,
    ) -> anyhow::Result<String>;

    async fn summarize_response(
        &self,
        task: &str,
        history: &[SupervisorStep],
        summary: Option<&str>,
        hint: Option<&str>,
    ) -> anyhow::Result<String>;
}

pub struct Supervisor {
    name: String,
    description: String,
    agents: Vec<NodeRef>,
    descriptors: Vec<NodeDescriptor>,
    strategy: Arc<dyn DelegationStrategy>,
    summarizer: Option<Arc<dyn Summarizer>>,
    context_strategy: ContextStrategy,
    response_strategy: ResponseStrategy,
    supervisor_context: Option<String>,
    task_key: String,
    max_steps: usize,
    output_key: Option<String>,
    recovery: RecoveryPolicy,
}

impl Supervisor {
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::default()
    }

    pub fn agents(&self) -> &[NodeDescriptor] {
        &self.descriptors
    }

    fn find(&self, name: &str) -> Option<&NodeRef> {
        self.agents.iter().find(|agent| agent.name() == name)
    }

    fn delegation_error(&self, source: anyhow::Error) -> WorkflowError {
        WorkflowError::Delegation {
            node: self.name.clone(),
            source,
        }
    }

    fn summarizer(&self) -> Result<&Arc<dyn Summarizer>> {
        self.summarizer.as_ref().ok_or_else(|| {
            WorkflowError::ConfigError(format!("supervisor '{}' has no summarizer", self.name))
        })
    }

    fn read_task(&self, scope: &Scope) -> Result<String> {
        match scope.read(&self.task_key) {
            Some(Value::String(task)) => Ok(task),
            Some(other) => Ok(other.to_string()),
            None => Err(WorkflowError::InputMissing {
                agent: self.name.clone(),
                key: self.task_key.clone(),
            }),
        }
    }

    async fn delegate(
        &self,
        scope: &Scope,
        agent: &str,
        arguments: &Arguments,
    ) -> Result<StepOutcome> {
        let Some(node) = self.find(agent) else {
            warn!(agent = %agent, "Strategy chose an unknown agent");
            return Ok(StepOutcome::Failed {
                error: format!("no agent named '{}'", agent),
            });
        };

        for (key, value) in arguments.iter() {
            scope.write(key.clone(), value.clone());
        }
        match node.invoke(scope).await {
            Ok(output) => Ok(StepOutcome::Completed {
                output: output.unwrap_or(Value::Null),
            }),
            Err(WorkflowError::Cancelled) => Err(WorkflowError::Cancelled),
            Err(err) => {
                warn!(agent = %agent, error = %err, "Sub-agent failed");
                Ok(StepOutcome::Failed {
                    error: err.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl Node for Supervisor {
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

    #[instrument(skip(self, scope), fields(supervisor = %self.name, invocation = %scope.id()))]
    async fn run(&self, scope: &Scope) -> Result<Option<Value>> {
        scope.settle().await?;
        let task = self.read_task(scope)?;

        let mut history: Vec<SupervisorStep> = Vec::new();
        let mut summary: Option<String> = None;
        let mut last_output: Option<Value> = None;
        let mut hint: Option<String> = None;
        let mut finished = false;

        for index in 0..self.max_steps {
            scope.check_cancelled()?;

            let visible = match self.context_strategy {
                ContextStrategy::Summarization => &history[history.len().saturating_sub(1)..],
                _ => &history[..],
            };
            let request = DelegationRequest {
                task: &task,
                supervisor_context: self.supervisor_context.as_deref(),
                agents: &self.descriptors,
                history: visible,
                summary: summary.as_deref(),
            };

            let decision = self
                .strategy
                .decide(&request)
                .await
                .map_err(|source| self.delegation_error(source))?;

            let (agent, arguments) = match decision {
                Delegation::Done { response } => {
                    debug!(steps = index, "Strategy finished the task");
                    hint = response;
                    finished = true;
                    break;
                }
                Delegation::Invoke { agent, arguments } => (agent, arguments),
            };

            let outcome = self.delegate(scope, &agent, &arguments).await?;
            if let StepOutcome::Completed { output } = &outcome {
                last_output = Some(output.clone());
            }
            let step = SupervisorStep {
                index,
                agent,
                arguments,
                outcome,
            };
            scope.emit(WorkflowEvent::SupervisorStep {
                invocation: scope.id(),
                node: self.name.clone(),
                step: index,
                agent: step.agent.clone(),
                succeeded: step.succeeded(),
            });
            info!(
                step = index,
                agent = %step.agent,
                succeeded = step.succeeded(),
                "Supervisor step"
            );

            if self.context_strategy.summarizes() {
                let next = self
                    .summarizer()?
                    .summarize_context(&task, summary.as_deref(), &step)
                    .await
                    .map_err(|source| self.delegation_error(source))?;
                summary = Some(next);
            }
            history.push(step);
        }

        if !finished {
            warn!(max_steps = self.max_steps, "Supervisor reached its step cap");
        }

        let response = match self.response_strategy {
            ResponseStrategy::Last => last_output
                .or_else(|| hint.map(Value::String))
                .unwrap_or(Value::Null),
            ResponseStrategy::Summary => Value::String(
                self.summarizer()?
                    .summarize_response(&task, &history, summary.as_deref(), hint.as_deref())
                    .await
                    .map_err(|source| self.delegation_error(source))?,
            ),
        };

        if let Some(key) = &self.output_key {
            scope.write(key.clone(), response.clone());
        }
        Ok(Some(response))
    }
}

/// Builder for [`Supervisor`]
#[derive(Default)]
pub struct SupervisorBuilder {
    name: Option<String>,
    description: String,
    agents: Vec<NodeRef>,
    strategy: Option<Arc<dyn DelegationStrategy>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    context_strategy: ContextStrategy,
    response_strategy: ResponseStrategy,
    supervisor_context: Option<String>,
    task_key: Option<String>,
    max_steps: Option<usize>,
    output_key: Option<String>,
    recovery: RecoveryPolicy,
}

impl SupervisorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn agent(mut self, agent: impl Node + 'static) -> Self {
        self.agents.push(Arc::new(agent));
        self
    }

    pub fn sub_agents(mut self, agents: impl IntoIterator<Item = NodeRef>) -> Self {
        self.agents.extend(agents);
        self
    }

    pub fn strategy(mut self, strategy: impl DelegationStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    pub fn summarizer(mut self, summarizer: impl Summarizer + 'static) -> Self {
        self.summarizer = Some(Arc::new(summarizer));
        self
    }

    pub fn context_strategy(mut self, strategy: ContextStrategy) -> Self {
        self.context_strategy = strategy;
        self
    }

    pub fn response_strategy(mut self, strategy: ResponseStrategy) -> Self {
        self.response_strategy = strategy;
        self
    }

    pub fn supervisor_context(mut self, context: impl Into<String>) -> Self {
        self.supervisor_context = Some(context.into());
        self
    }

    /// Scope key holding the task description, `request` by default
    pub fn task_key(mut self, key: impl Into<String>) -> Self {
        self.task_key = Some(key.into());
        self
    }

    pub fn max_steps(mut self, max: usize) -> Self {
        self.max_steps = Some(max);
        self
    }

    pub fn configure(mut self, config: &EngineConfig) -> Self {
        if self.max_steps.is_none() {
            self.max_steps = Some(config.supervisor_max_steps);
        }
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

    pub fn build(self) -> Result<Supervisor> {
        let strategy = self
            .strategy
            .ok_or_else(|| {
                WorkflowError::ConfigError("supervisor needs a delegation strategy".into())
            })?;
        if self.agents.is_empty() {
            return Err(WorkflowError::ConfigError(
                "supervisor needs at least one sub-agent".into(),
            ));
        }
        let mut names = HashSet::new();
        for agent in &self.agents {
            if !names.insert(agent.name().to_string()) {
                return Err(WorkflowError::ConfigError(format!(
                    "duplicate sub-agent name '{}'",
                    agent.name()
                )));
            }
        }
        let needs_summarizer = self.context_strategy.summarizes()
            || self.response_strategy == ResponseStrategy::Summary;
        if needs_summarizer && self.summarizer.is_none() {
            return Err(WorkflowError::ConfigError(
                "summarizing strategies need a summarizer".into(),
            ));
        }
        let max_steps = self
            .max_steps
            .unwrap_or_else(|| EngineConfig::default().supervisor_max_steps);
        if max_steps == 0 {
            return Err(WorkflowError::ConfigError("max_steps must be positive".into()));
        }

        let descriptors = self.agents.iter().map(|agent| agent.descriptor()).collect();
        Ok(Supervisor {
            name: self.name.unwrap_or_else(|| "supervisor".to_string()),
            description: self.description,
            agents: self.agents,
            descriptors,
            strategy,
            summarizer: self.summarizer,
            context_strategy: self.context_strategy,
            response_strategy: self.response_strategy,
            supervisor_context: self.supervisor_context,
            task_key: self.task_key.unwrap_or_else(|| "request".to_string()),
            max_steps,
            output_key: self.output_key,
            recovery: self.recovery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentNode, FnAgent};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Replays a fixed script of decisions and records what it was shown
    struct Scripted {
        script: Mutex<Vec<Delegation>>,
        seen: Mutex<Vec<(Option<String>, usize, Option<String>)>>,
    }

    impl Scripted {
        fn new(mut script: Vec<Delegation>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DelegationStrategy for Arc<Scripted> {
        async fn decide(&self, request: &DelegationRequest<'_>) -> anyhow::Result<Delegation> {
            self.seen.lock().push((
                request.supervisor_context.map(str::to_string),
                request.history.len(),
                request.summary.map(str::to_string),
            ));
            Ok(self
                .script
                .lock()
                .pop()
                .unwrap_or(Delegation::Done { response: None }))
        }
    }

    struct Concat;

    #[async_trait]
    impl Summarizer for Concat {
        async fn summarize_context(
            &self,
            _task: &str,
            previous: Option<&str>,
            step: &SupervisorStep,
        ) -> anyhow::Result<String> {
            Ok(format!("{}[{}]", previous.unwrap_or(""), step.agent))
        }

        async fn summarize_response(
            &self,
            task: &str,
            history: &[SupervisorStep],
            _summary: Option<&str>,
            _hint: Option<&str>,
        ) -> anyhow::Result<String> {
            Ok(format!("{}: {} steps", task, history.len()))
        }
    }

    fn bank_agent(name: &str, verb: &'static str) -> NodeRef {
        Arc::new(AgentNode::new(
            FnAgent::new(name, format!("{}Result", name), move |args| async move {
                let user = args.get_str("user").unwrap_or("?").to_string();
                let amount = args.get("amount").and_then(Value::as_u64).unwrap_or(0);
                Ok(json!(format!("{} {} {}", verb, amount, user)))
            })
            .with_description(format!("{} money", verb))
            .input("user")
            .input("amount"),
        ))
    }

    fn invoke(agent: &str, user: &str, amount: u64) -> Delegation {
        Delegation::Invoke {
            agent: agent.to_string(),
            arguments: Arguments::new().with("user", json!(user)).with("amount", json!(amount)),
        }
    }

    #[tokio::test]
    async fn test_delegates_until_done_and_returns_last() {
        let strategy = Scripted::new(vec![
            invoke("withdraw", "Mario", 100),
            invoke("credit", "Georgios", 100),
            Delegation::Done { response: Some("transfer complete".into()) },
        ]);
        let supervisor = Supervisor::builder()
            .name("bank")
            .sub_agents([bank_agent("withdraw", "withdrew"), bank_agent("credit", "credited")])
            .strategy(Arc::clone(&strategy))
            .supervisor_context("Policies: prefer internal tools; currency USD")
            .output_key("response")
            .build()
            .unwrap();

        let scope =
            Scope::with_arguments([("request", json!("Transfer 100 from Mario to Georgios"))]);
        let output = supervisor.invoke(&scope).await.unwrap();
        assert_eq!(output, Some(json!("credited 100 Georgios")));
        assert_eq!(scope.read("response"), output);

        let seen = strategy.seen.lock();
        assert_eq!(seen.len(), 3);
        let policy = "Policies: prefer internal tools; currency USD";
        assert!(seen.iter().all(|(ctx, _, _)| ctx.as_deref() == Some(policy)));
        assert_eq!(seen.iter().map(|(_, n, _)| *n).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failure_is_an_observation() {
        let strategy = Scripted::new(vec![
            Delegation::Invoke { agent: "withdraw".into(), arguments: Arguments::new() },
            Delegation::Invoke { agent: "teleport".into(), arguments: Arguments::new() },
            invoke("withdraw", "Mario", 5),
        ]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let supervisor = Supervisor::builder()
            .sub_agents([bank_agent("withdraw", "withdrew")])
            .strategy(Arc::clone(&strategy))
            .build()
            .unwrap();

        let scope = Scope::with_arguments([("request", json!("withdraw"))]).with_events(tx);
        let output = supervisor.invoke(&scope).await.unwrap();
        assert_eq!(output, Some(json!("withdrew 5 Mario")));

        let mut outcomes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::SupervisorStep { succeeded, .. } = event {
                outcomes.push(succeeded);
            }
        }
        assert_eq!(outcomes, vec![false, false, true]);
    }

    #[tokio::test]
    async fn test_step_cap() {
        let strategy = Scripted::new((0..20).map(|_| invoke("withdraw", "Mario", 1)).collect());
        let supervisor = Supervisor::builder()
            .sub_agents([bank_agent("withdraw", "withdrew")])
            .strategy(Arc::clone(&strategy))
            .max_steps(3)
            .build()
            .unwrap();

        let scope = Scope::with_arguments([("request", json!("loop forever"))]);
        supervisor.invoke(&scope).await.unwrap();
        assert_eq!(strategy.seen.lock().len(), 3);
        assert_eq!(scope.invocations().len(), 3);
    }

    #[tokio::test]
    async fn test_summarization_and_summary_response() {
        let strategy = Scripted::new(vec![
            invoke("withdraw", "Mario", 10),
            invoke("credit", "Georgios", 10),
        ]);
        let supervisor = Supervisor::builder()
            .sub_agents([bank_agent("withdraw", "withdrew"), bank_agent("credit", "credited")])
            .strategy(Arc::clone(&strategy))
            .summarizer(Concat)
            .context_strategy(ContextStrategy::Summarization)
            .response_strategy(ResponseStrategy::Summary)
            .build()
            .unwrap();

        let scope = Scope::with_arguments([("request", json!("move money"))]);
        let output = supervisor.invoke(&scope).await.unwrap();
        assert_eq!(output, Some(json!("move money: 2 steps")));

        let seen = strategy.seen.lock();
        let summaries: Vec<Option<String>> = seen.iter().map(|(_, _, s)| s.clone()).collect();
        assert_eq!(
            summaries,
            vec![None, Some("[withdraw]".into()), Some("[withdraw][credit]".into())]
        );
        assert!(seen.iter().all(|(_, visible, _)| *visible <= 1));
    }

    #[tokio::test]
    async fn test_missing_task() {
        let supervisor = Supervisor::builder()
            .sub_agents([bank_agent("withdraw", "withdrew")])
            .strategy(Scripted::new(Vec::new()))
            .build()
            .unwrap();
        let err = supervisor.invoke(&Scope::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InputMissing { ref key, .. } if key == "request"));
    }

    #[test]
    fn test_builder_validation() {
        assert!(Supervisor::builder().sub_agents([bank_agent("a", "x")]).build().is_err());
        assert!(Supervisor::builder().strategy(Scripted::new(Vec::new())).build().is_err());
        assert!(Supervisor::builder()
            .sub_agents([bank_agent("a", "x"), bank_agent("a", "y")])
            .strategy(Scripted::new(Vec::new()))
            .build()
            .is_err());
        assert!(Supervisor::builder()
            .sub_agents([bank_agent("a", "x")])
            .strategy(Scripted::new(Vec::new()))
            .response_strategy(ResponseStrategy::Summary)
            .build()
            .is_err());

        let supervisor = Supervisor::builder()
            .sub_agents([bank_agent("withdraw", "withdrew")])
            .strategy(Scripted::new(Vec::new()))
            .build()
            .unwrap();
        assert_eq!(supervisor.agents()[0].description, "withdrew money");
        assert_eq!(supervisor.agents()[0].inputs, vec!["user".to_string(), "amount".to_string()]);
    }
}
