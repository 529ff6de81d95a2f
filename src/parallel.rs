//! Parallel - concurrent fan-out with a deterministic join

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{Result, WorkflowError};
use crate::node::{Node, NodeRef};
use crate::recovery::RecoveryPolicy;
use crate::scope::{Scope, ScopeSnapshot};

/// Join-time function combining the children's outputs
pub type AggregateFn = Arc<dyn Fn(&ScopeSnapshot) -> anyhow::Result<Value> + Send + Sync>;

/// Runs its children concurrently, each on its own fork of the scope, then
/// merges their writes in registration order and aggregates.
///
/// Children are expected to write disjoint keys. When two children do write
/// the same key the later-registered child's value wins and a warning is
/// logged.
pub struct Parallel {
    name: String,
    description: String,
    children: Vec<NodeRef>,
    parallelism: usize,
    aggregate: Option<AggregateFn>,
    output_key: Option<String>,
    recovery: RecoveryPolicy,
}

impl Parallel {
    pub fn builder() -> ParallelBuilder {
        ParallelBuilder::default()
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    async fn fan_out(&self, scope: &Scope) -> Result<Vec<Scope>> {
        let pool = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks = JoinSet::new();
        // Stops work the branches spawned once the join is over
        let join = scope.cancellation().child_token();
        let _joined = join.clone().drop_guard();

        for (index, child) in self.children.iter().enumerate() {
            scope.check_cancelled()?;
            let child = Arc::clone(child);
            let branch = scope.fork_under(join.clone());
            let pool = Arc::clone(&pool);
            tasks.spawn(async move {
                let result = match pool.acquire_owned().await {
                    Ok(_permit) => match child.invoke(&branch).await {
                        Ok(_) => branch.settle().await,
                        Err(err) => Err(err),
                    },
                    Err(_) => Err(WorkflowError::Cancelled),
                };
                (index, branch, result)
            });
        }

        let mut branches: Vec<Option<Scope>> = vec![None; self.children.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, branch, result) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    tasks.abort_all();
                    return Err(WorkflowError::execution(
                        &self.name,
                        anyhow::anyhow!("branch task aborted: {}", join_err),
                    ));
                }
            };
            if let Err(err) = result {
                let child = self.children[index].name();
                warn!(branch = index, child = %child, error = %err, "Branch failed, aborting join");
                tasks.abort_all();
                return Err(err);
            }
            debug!(branch = index, "Branch completed");
            branches[index] = Some(branch);
        }

        Ok(branches.into_iter().flatten().collect())
    }
}

#[async_trait]
impl Node for Parallel {
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

    #[instrument(skip(self, scope), fields(parallel = %self.name, invocation = %scope.id()))]
    async fn run(&self, scope: &Scope) -> Result<Option<Value>> {
        scope.settle().await?;
        let branches = self.fan_out(scope).await?;

        let mut seen = HashSet::new();
        for branch in &branches {
            let overlapping = scope.absorb(branch, &mut seen);
            if !overlapping.is_empty() {
                warn!(keys = ?overlapping, "Parallel branches wrote the same keys");
            }
        }
        info!(branches = branches.len(), "Parallel join completed");

        match &self.aggregate {
            Some(aggregate) => {
                let value = aggregate(&scope.snapshot()).map_err(|source| {
                    WorkflowError::AggregationFailed {
                        node: self.name.clone(),
                        source,
                    }
                })?;
                if let Some(key) = &self.output_key {
                    scope.write(key.clone(), value.clone());
                }
                Ok(Some(value))
            }
            None => Ok(self.output_key.as_deref().and_then(|key| scope.read(key))),
        }
    }
}

/// Builder for [`Parallel`]
#[derive(Default)]
pub struct ParallelBuilder {
    name: Option<String>,
    description: String,
    children: Vec<NodeRef>,
    parallelism: Option<usize>,
    aggregate: Option<AggregateFn>,
    output_key: Option<String>,
    recovery: RecoveryPolicy,
}

impl ParallelBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn branch(mut self, child: impl Node + 'static) -> Self {
        self.children.push(Arc::new(child));
        self
    }

    pub fn sub_agents(mut self, children: impl IntoIterator<Item = NodeRef>) -> Self {
        self.children.extend(children);
        self
    }

    /// Worker pool size; defaults to the number of children
    pub fn parallelism(mut self, workers: usize) -> Self {
        self.parallelism = Some(workers);
        self
    }

    pub fn configure(mut self, config: &EngineConfig) -> Self {
        if self.parallelism.is_none() {
            self.parallelism = config.parallelism;
        }
        self
    }

    pub fn aggregate<F>(mut self, aggregate: F) -> Self
    where
        F: Fn(&ScopeSnapshot) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.aggregate = Some(Arc::new(aggregate));
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

    pub fn build(self) -> Result<Parallel> {
        if self.children.is_empty() {
            return Err(WorkflowError::ConfigError("parallel needs at least one child".into()));
        }
        let parallelism = self.parallelism.unwrap_or(self.children.len());
        if parallelism == 0 {
            return Err(WorkflowError::ConfigError("parallelism must be positive".into()));
        }
        Ok(Parallel {
            name: self.name.unwrap_or_else(|| "parallel".to_string()),
            description: self.description,
            children: self.children,
            parallelism,
            aggregate: self.aggregate,
            output_key: self.output_key,
            recovery: self.recovery,
        })
    }
}
