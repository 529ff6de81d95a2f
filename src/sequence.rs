//! Sequence - ordered chaining of nodes on one scope

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::error::{Result, WorkflowError};
use crate::node::{Node, NodeRef, OutputFn, OutputSpec};
use crate::recovery::RecoveryPolicy;
use crate::scope::{Scope, ScopeSnapshot};

/// Runs its children one after another; each child sees the writes of the
/// ones before it
pub struct Sequence {
    name: String,
    description: String,
    children: Vec<NodeRef>,
    output: OutputSpec,
    recovery: RecoveryPolicy,
}

impl Sequence {
    pub fn builder() -> SequenceBuilder {
        SequenceBuilder::default()
    }

    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }
}

#[async_trait]
impl Node for Sequence {
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

    #[instrument(skip(self, scope), fields(sequence = %self.name, invocation = %scope.id()))]
    async fn run(&self, scope: &Scope) -> Result<Option<Value>> {
        for (index, child) in self.children.iter().enumerate() {
            scope.check_cancelled()?;
            debug!(step = index, child = %child.name(), "Running sequence step");
            child.invoke(scope).await?;
        }
        info!(steps = self.children.len(), "Sequence completed");
        let deferred_output = self.output.key().is_some_and(|key| scope.is_pending(key));
        if self.output.extract.is_some() || deferred_output {
            scope.settle().await?;
        }
        self.output.resolve(&self.name, scope)
    }
}

/// Builder for [`Sequence`]
#[derive(Default)]
pub struct SequenceBuilder {
    name: Option<String>,
    description: String,
    children: Vec<NodeRef>,
    output: OutputSpec,
    recovery: RecoveryPolicy,
}

impl SequenceBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn then(mut self, child: impl Node + 'static) -> Self {
        self.children.push(Arc::new(child));
        self
    }

    pub fn sub_agents(mut self, children: impl IntoIterator<Item = NodeRef>) -> Self {
        self.children.extend(children);
        self
    }

    /// Key the sequence's result is read from, or written to when an
    /// extraction function is set
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

    pub fn build(self) -> Result<Sequence> {
        if self.children.is_empty() {
            return Err(WorkflowError::ConfigError("sequence needs at least one child".into()));
        }
        Ok(Sequence {
            name: self.name.unwrap_or_else(|| "sequence".to_string()),
            description: self.description,
            children: self.children,
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
    use std::time::Duration;

    fn slow_writer() -> AgentNode {
        AgentNode::new(
            FnAgent::new("creative-writer", "story", |args: Arguments| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!(format!("draft about {}", args.get_str("topic").unwrap_or("nothing"))))
            })
            .input("topic"),
        )
    }

    fn editor() -> AgentNode {
        AgentNode::new(
            FnAgent::new("style-editor", "story", |args: Arguments| async move {
                let story = args.get_str("story").unwrap_or("");
                let style = args.get_str("style").unwrap_or("");
                Ok(json!(format!("{} (edited in {} style)", story, style)))
            })
            .input("story")
            .input("style"),
        )
    }

    #[tokio::test]
    async fn test_order_preserved_despite_latency() {
        let sequence = Sequence::builder()
            .name("novel-creator")
            .then(slow_writer())
            .then(editor())
            .output_key("story")
            .build()
            .unwrap();

        let scope =
            Scope::with_arguments([("topic", json!("dragons")), ("style", json!("comedy"))]);
        let output = sequence.invoke(&scope).await.unwrap();
        assert_eq!(output, Some(json!("draft about dragons (edited in comedy style)")));

        let order: Vec<String> = scope.invocations().into_iter().map(|i| i.agent).collect();
        assert_eq!(order, vec!["creative-writer", "style-editor"]);
    }

    #[tokio::test]
    async fn test_output_function() {
        let sequence = Sequence::builder()
            .then(slow_writer())
            .output(|snapshot| {
                Ok(json!({
                    "topic": snapshot.get("topic").cloned(),
                    "story": snapshot.get("story").cloned(),
                }))
            })
            .output_key("bundle")
            .build()
            .unwrap();

        let scope = Scope::with_arguments([("topic", json!("owls"))]);
        sequence.invoke(&scope).await.unwrap();
        assert_eq!(
            scope.read("bundle"),
            Some(json!({ "topic": "owls", "story": "draft about owls" }))
        );
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_children() {
        let later_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&later_calls);
        let later = AgentNode::new(FnAgent::new("later", "later", move |_args| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!(true)) }
        }));

        let sequence = Sequence::builder()
            .then(slow_writer())
            .then(later)
            .build()
            .unwrap();

        let err = sequence.invoke(&Scope::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InputMissing { .. }));
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_child_fallback_lets_sequence_continue() {
        let failing = AgentNode::new(FnAgent::new("classifier", "category", |_args| async {
            Err(anyhow::anyhow!("model timeout"))
        }))
        .with_recovery(RecoveryPolicy::fallback_value(json!("UNKNOWN")));
        let echo = AgentNode::new(
            FnAgent::new("echo", "response", |args: Arguments| async move {
                Ok(args.get("category").cloned().unwrap_or(Value::Null))
            })
            .input("category"),
        );

        let sequence = Sequence::builder()
            .then(failing)
            .then(echo)
            .output_key("response")
            .build()
            .unwrap();
        let output = sequence.invoke(&Scope::new()).await.unwrap();
        assert_eq!(output, Some(json!("UNKNOWN")));
    }

    #[tokio::test]
    async fn test_cancelled_between_children() {
        let sequence = Sequence::builder().then(slow_writer()).build().unwrap();
        let scope = Scope::with_arguments([("topic", json!("x"))]);
        scope.cancellation().cancel();
        assert!(matches!(sequence.invoke(&scope).await, Err(WorkflowError::Cancelled)));
        assert!(scope.read("story").is_none());
    }

    #[test]
    fn test_empty_sequence_rejected() {
        assert!(matches!(Sequence::builder().build(), Err(WorkflowError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_own_retry_restarts_from_first_child() {
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&writes);
        let writer = AgentNode::new(FnAgent::new("creative-writer", "story", move |_args| {
            let draft = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(json!(format!("draft {}", draft))) }
        }));
        let reviews = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reviews);
        let reviewer = AgentNode::new(
            FnAgent::new("reviewer", "review", move |args: Arguments| {
                let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                let story = args.get_str("story").unwrap_or("").to_string();
                async move {
                    if first {
                        anyhow::bail!("reviewer overloaded");
                    }
                    Ok(json!(format!("{} approved", story)))
                }
            })
            .input("story"),
        );

        let sequence = Sequence::builder()
            .then(writer)
            .then(reviewer)
            .output_key("review")
            .recovery(RecoveryPolicy::retry(1))
            .build()
            .unwrap();

        let scope = Scope::new();
        assert_eq!(sequence.invoke(&scope).await.unwrap(), Some(json!("draft 2 approved")));
        assert_eq!(writes.load(Ordering::SeqCst), 2);
        assert_eq!(reviews.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abort_unwinds_to_parent_fallback() {
        let broken = AgentNode::new(FnAgent::new("classifier", "category", |_args| async {
            Err::<Value, _>(anyhow::anyhow!("model timeout"))
        }));
        let inner = Sequence::builder().name("inner").then(broken).build().unwrap();
        let outer = Sequence::builder()
            .name("outer")
            .then(inner)
            .output_key("response")
            .recovery(RecoveryPolicy::fallback_value(json!("sorry, try later")))
            .build()
            .unwrap();

        let scope = Scope::new();
        assert_eq!(outer.invoke(&scope).await.unwrap(), Some(json!("sorry, try later")));
        assert_eq!(scope.read("response"), Some(json!("sorry, try later")));
        assert!(scope.read("category").is_none());
    }
}
