//! Per-node error recovery: retry, fallback or abort

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::Result;
use crate::events::WorkflowEvent;
use crate::node::{Node, NodeRef};
use crate::scope::Scope;

/// What a node does when its own invocation fails
#[derive(Clone, Default)]
pub enum RecoveryPolicy {
    /// Propagate the failure to the parent
    #[default]
    Abort,
    /// Re-invoke up to `attempts` more times, pausing `backoff` in between
    Retry { attempts: u32, backoff: Duration },
    /// Substitute a value or an alternate node and continue
    Fallback(Fallback),
}

/// Replacement used by [`RecoveryPolicy::Fallback`]
#[derive(Clone)]
pub enum Fallback {
    Value(Value),
    Node(NodeRef),
}

impl RecoveryPolicy {
    pub fn retry(attempts: u32) -> Self {
        Self::Retry {
            attempts,
            backoff: Duration::ZERO,
        }
    }

    pub fn fallback_value(value: Value) -> Self {
        Self::Fallback(Fallback::Value(value))
    }

    pub fn fallback_node(node: NodeRef) -> Self {
        Self::Fallback(Fallback::Node(node))
    }
}

impl fmt::Debug for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => f.write_str("Abort"),
            Self::Retry { attempts, backoff } => f
                .debug_struct("Retry")
                .field("attempts", attempts)
                .field("backoff", backoff)
                .finish(),
            Self::Fallback(Fallback::Value(value)) => {
                f.debug_tuple("FallbackValue").field(value).finish()
            }
            Self::Fallback(Fallback::Node(node)) => {
                f.debug_tuple("FallbackNode").field(&node.name()).finish()
            }
        }
    }
}

/// Run `node` once and resolve a failure through its recovery descriptor
pub(crate) async fn resolve<N: Node + ?Sized>(node: &N, scope: &Scope) -> Result<Option<Value>> {
    let err = match node.run(scope).await {
        Ok(output) => return Ok(output),
        Err(err) if !err.is_recoverable() => return Err(err),
        Err(err) => err,
    };

    match node.recovery() {
        RecoveryPolicy::Abort => Err(err),
        RecoveryPolicy::Retry { attempts, backoff } => {
            let mut last = err;
            for attempt in 1..=*attempts {
                warn!(node = %node.name(), attempt, error = %last, "Retrying node");
                scope.emit(WorkflowEvent::RetryScheduled {
                    invocation: scope.id(),
                    node: node.name().to_string(),
                    attempt,
                    error: last.to_string(),
                });
                if !backoff.is_zero() {
                    tokio::time::sleep(*backoff).await;
                }
                scope.check_cancelled()?;
                match node.run(scope).await {
                    Ok(output) => return Ok(output),
                    Err(err) if !err.is_recoverable() => return Err(err),
                    Err(err) => last = err,
                }
            }
            warn!(node = %node.name(), attempts, "Retries exhausted");
            Err(last)
        }
        RecoveryPolicy::Fallback(fallback) => {
            warn!(node = %node.name(), error = %err, "Applying fallback");
            scope.emit(WorkflowEvent::FallbackApplied {
                invocation: scope.id(),
                node: node.name().to_string(),
                error: err.to_string(),
            });
            let value = match fallback {
                Fallback::Value(value) => Some(value.clone()),
                Fallback::Node(alternate) => {
                    info!(
                        node = %node.name(),
                        alternate = %alternate.name(),
                        "Invoking alternate node"
                    );
                    alternate.invoke(scope).await?
                }
            };
            if let (Some(key), Some(value)) = (node.output_key(), &value) {
                scope.write(key, value.clone());
            }
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentNode, FnAgent};
    use crate::error::WorkflowError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> FnAgent {
        FnAgent::new("flaky", "result", move |_args| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    anyhow::bail!("transient failure {}", n + 1);
                }
                Ok(json!("done"))
            }
        })
    }

    #[tokio::test]
    async fn test_retry_two_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let node =
            AgentNode::new(flaky(2, Arc::clone(&calls))).with_recovery(RecoveryPolicy::retry(2));

        let scope = Scope::new();
        let output = node.invoke(&scope).await.unwrap();
        assert_eq!(output, Some(json!("done")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scope.read("result"), Some(json!("done")));
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = AgentNode::new(flaky(5, Arc::clone(&calls))).with_recovery(
            RecoveryPolicy::Retry {
                attempts: 2,
                backoff: Duration::from_millis(1),
            },
        );

        let err = node.invoke(&Scope::new()).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("transient failure 3"));
    }

    #[tokio::test]
    async fn test_abort_is_default() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = AgentNode::new(flaky(1, Arc::clone(&calls)));

        let err = node.invoke(&Scope::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ExecutionFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_value_written_to_output_key() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = AgentNode::new(flaky(1, calls))
            .with_recovery(RecoveryPolicy::fallback_value(json!("default answer")));

        let scope = Scope::new();
        let output = node.invoke(&scope).await.unwrap();
        assert_eq!(output, Some(json!("default answer")));
        assert_eq!(scope.read("result"), Some(json!("default answer")));
    }

    #[tokio::test]
    async fn test_fallback_node() {
        let calls = Arc::new(AtomicU32::new(0));
        let backup = FnAgent::new("backup", "backupResult", |_args| async {
            Ok(json!("from backup"))
        });
        let alternate: NodeRef = Arc::new(AgentNode::new(backup));
        let node =
            AgentNode::new(flaky(1, calls)).with_recovery(RecoveryPolicy::fallback_node(alternate));

        let scope = Scope::new();
        node.invoke(&scope).await.unwrap();
        assert_eq!(scope.read("result"), Some(json!("from backup")));
        assert_eq!(scope.read("backupResult"), Some(json!("from backup")));
    }

    #[tokio::test]
    async fn test_cancelled_is_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let node =
            AgentNode::new(flaky(0, Arc::clone(&calls))).with_recovery(RecoveryPolicy::retry(3));

        let scope = Scope::new();
        scope.cancellation().cancel();
        let err = node.invoke(&scope).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
