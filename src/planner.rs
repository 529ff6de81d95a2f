//! Planner - goal-directed composition over a registry of nodes
//!
//! A planning strategy turns a goal key into an ordered list of node names;
//! the planner node runs that list on the scope and returns the goal value.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::node::{Node, NodeRef};
use crate::recovery::RecoveryPolicy;
use crate::scope::Scope;

/// Computes which nodes to run, in order, to produce `goal`
#[async_trait]
pub trait PlanningStrategy: Send + Sync {
    async fn plan(&self, goal: &str, nodes: &[NodeRef], scope: &Scope) -> Result<Vec<String>>;
}

/// Backward chaining from the goal through declared inputs and outputs.
///
/// Keys already in the scope count as satisfied. An input with a default
/// is only planned for when some node produces it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoalOriented;

struct Search<'a> {
    nodes: &'a [NodeRef],
    producers: HashMap<&'a str, usize>,
    available: HashSet<String>,
    visiting: Vec<String>,
    planned: Vec<usize>,
    missing: Vec<String>,
}

impl Search<'_> {
    fn resolve(&mut self, key: &str) -> bool {
        if self.available.contains(key) {
            return true;
        }
        if self.visiting.iter().any(|k| k == key) {
            self.unresolved(format!("{} (cycle)", key));
            return false;
        }
        let Some(&index) = self.producers.get(key) else {
            self.unresolved(key.to_string());
            return false;
        };

        self.visiting.push(key.to_string());
        let mut satisfied = true;
        for input in self.nodes[index].inputs() {
            if input.default.is_some() && !self.producers.contains_key(input.key.as_str()) {
                continue;
            }
            satisfied &= self.resolve(&input.key);
        }
        self.visiting.pop();

        if satisfied {
            self.planned.push(index);
            self.available.insert(key.to_string());
        }
        satisfied
    }

    fn unresolved(&mut self, key: String) {
        if !self.missing.contains(&key) {
            self.missing.push(key);
        }
    }
}

#[async_trait]
impl PlanningStrategy for GoalOriented {
    async fn plan(&self, goal: &str, nodes: &[NodeRef], scope: &Scope) -> Result<Vec<String>> {
        let mut producers = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            if let Some(key) = node.output_key() {
                producers.entry(key).or_insert(index);
            }
        }

        let mut search = Search {
            nodes,
            producers,
            available: scope.keys().into_iter().collect(),
            visiting: Vec::new(),
            planned: Vec::new(),
            missing: Vec::new(),
        };

        // The goal itself is always recomputed, even if a stale value exists
        search.available.remove(goal);
        if !search.resolve(goal) {
            return Err(WorkflowError::PlanNotFound {
                goal: goal.to_string(),
                missing: search.missing,
            });
        }
        Ok(search
            .planned
            .into_iter()
            .map(|index| nodes[index].name().to_string())
            .collect())
    }
}

/// Runs whatever sub-agents its strategy deems necessary to reach the goal
pub struct Planner {
    name: String,
    description: String,
    nodes: Vec<NodeRef>,
    strategy: Arc<dyn PlanningStrategy>,
    goal: String,
    recovery: RecoveryPolicy,
}

impl Planner {
    pub fn builder() -> PlannerBuilder {
        PlannerBuilder::default()
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    /// Compute the plan for this scope without running it
    pub async fn plan(&self, scope: &Scope) -> Result<Vec<String>> {
        self.strategy.plan(&self.goal, &self.nodes, scope).await
    }
}

#[async_trait]
impl Node for Planner {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn output_key(&self) -> Option<&str> {
        Some(&self.goal)
    }

    fn recovery(&self) -> &RecoveryPolicy {
        &self.recovery
    }

    #[instrument(
        skip(self, scope),
        fields(planner = %self.name, goal = %self.goal, invocation = %scope.id())
    )]
    async fn run(&self, scope: &Scope) -> Result<Option<Value>> {
        scope.settle().await?;
        let steps = self.plan(scope).await?;
        info!(steps = ?steps, "Plan computed");
        scope.emit(WorkflowEvent::PlanComputed {
            invocation: scope.id(),
            node: self.name.clone(),
            steps: steps.clone(),
        });

        for step in &steps {
            scope.check_cancelled()?;
            let node = self
                .nodes
                .iter()
                .find(|node| node.name() == step)
                .ok_or_else(|| WorkflowError::PlanNotFound {
                    goal: self.goal.clone(),
                    missing: vec![step.clone()],
                })?;
            debug!(step = %step, "Running plan step");
            node.invoke(scope).await?;
        }

        scope.settle().await?;
        match scope.read(&self.goal) {
            Some(value) => Ok(Some(value)),
            None => Err(WorkflowError::PlanNotFound {
                goal: self.goal.clone(),
                missing: vec![self.goal.clone()],
            }),
        }
    }
}

/// Builder for [`Planner`]
#[derive(Default)]
pub struct PlannerBuilder {
    name: Option<String>,
    description: String,
    nodes: Vec<NodeRef>,
    strategy: Option<Arc<dyn PlanningStrategy>>,
    goal: Option<String>,
    recovery: RecoveryPolicy,
}

impl PlannerBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn agent(mut self, node: impl Node + 'static) -> Self {
        self.nodes.push(Arc::new(node));
        self
    }

    pub fn sub_agents(mut self, nodes: impl IntoIterator<Item = NodeRef>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// Defaults to [`GoalOriented`]
    pub fn strategy(mut self, strategy: impl PlanningStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    /// The scope key the planner must produce
    pub fn output_key(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn build(self) -> Result<Planner> {
        let goal = self
            .goal
            .ok_or_else(|| WorkflowError::ConfigError("planner needs a goal output key".into()))?;
        if self.nodes.is_empty() {
            return Err(WorkflowError::ConfigError("planner needs at least one sub-agent".into()));
        }
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name().to_string()) {
                return Err(WorkflowError::ConfigError(format!(
                    "duplicate sub-agent name '{}'",
                    node.name()
                )));
            }
        }

        Ok(Planner {
            name: self.name.unwrap_or_else(|| "planner".to_string()),
            description: self.description,
            nodes: self.nodes,
            strategy: self.strategy.unwrap_or_else(|| Arc::new(GoalOriented)),
            goal,
            recovery: self.recovery,
        })
    }
}
