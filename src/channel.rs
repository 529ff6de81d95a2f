//! Communication channels for the orchestrator

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::agent::Arguments;
use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::scope::InvocationId;

/// Operations submitted to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Start a registered workflow under a client-chosen id
    Invoke {
        invocation: InvocationId,
        workflow: String,
        arguments: Arguments,
    },
    /// Cancel a running invocation
    Cancel { invocation: InvocationId },
    /// Cancel everything and stop the event loop
    Shutdown,
}

/// Orchestrator side of the channel
pub struct ChannelPair {
    /// Receiver for operations
    pub op_rx: mpsc::UnboundedReceiver<Op>,
    /// Sender for events
    pub event_tx: mpsc::UnboundedSender<WorkflowEvent>,
}

/// Client-side channel for communicating with the orchestrator
#[derive(Clone)]
pub struct EngineChannel {
    op_tx: mpsc::UnboundedSender<Op>,
    event_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkflowEvent>>>,
    /// Events of other invocations passed over by [`EngineChannel::finished`]
    held: Arc<Mutex<VecDeque<WorkflowEvent>>>,
}

impl EngineChannel {
    /// Create a new channel pair
    ///
    /// Returns the client channel and the orchestrator channel pair
    pub fn new() -> (Self, ChannelPair) {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let channel = Self {
            op_tx,
            event_rx: Arc::new(tokio::sync::Mutex::new(event_rx)),
            held: Arc::new(Mutex::new(VecDeque::new())),
        };

        (channel, ChannelPair { op_rx, event_tx })
    }

    /// Send an operation to the orchestrator
    pub fn send(&self, op: Op) -> Result<()> {
        self.op_tx
            .send(op)
            .map_err(|_| WorkflowError::ChannelError("orchestrator is gone".into()))
    }

    /// Start `workflow` and return the id its events will carry
    pub fn invoke(
        &self,
        workflow: impl Into<String>,
        arguments: Arguments,
    ) -> Result<InvocationId> {
        let invocation = InvocationId::new();
        self.send(Op::Invoke {
            invocation,
            workflow: workflow.into(),
            arguments,
        })?;
        Ok(invocation)
    }

    pub fn cancel(&self, invocation: InvocationId) -> Result<()> {
        self.send(Op::Cancel { invocation })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Op::Shutdown)
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<WorkflowEvent> {
        if let Some(event) = self.held.lock().pop_front() {
            return Some(event);
        }
        self.event_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Receive the next event
    pub async fn recv(&self) -> Option<WorkflowEvent> {
        let held = self.held.lock().pop_front();
        if held.is_some() {
            return held;
        }
        self.event_rx.lock().await.recv().await
    }

    /// Wait until `invocation` completes or fails and return that terminal
    /// event.
    ///
    /// Progress events of `invocation` are discarded. Events of other
    /// invocations are held back for later `recv`/`finished` calls.
    pub async fn finished(&self, invocation: InvocationId) -> Option<WorkflowEvent> {
        {
            let mut held = self.held.lock();
            let position = held
                .iter()
                .position(|event| event.invocation() == invocation && is_terminal(event));
            if let Some(position) = position {
                return held.remove(position);
            }
        }

        let mut events = self.event_rx.lock().await;
        while let Some(event) = events.recv().await {
            if event.invocation() != invocation {
                self.held.lock().push_back(event);
            } else if is_terminal(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Check if the channel is closed
    pub fn is_closed(&self) -> bool {
        self.op_tx.is_closed()
    }
}

fn is_terminal(event: &WorkflowEvent) -> bool {
    matches!(
        event,
        WorkflowEvent::InvocationCompleted { .. } | WorkflowEvent::InvocationFailed { .. }
    )
}

impl Default for EngineChannel {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_creation() {
        let (channel, _pair) = EngineChannel::new();
        assert!(!channel.is_closed());
    }

    #[test]
    fn test_send_op() {
        let (channel, mut pair) = EngineChannel::new();

        let id = channel.invoke("novel", Arguments::new().with("topic", json!("owls"))).unwrap();

        let received = pair.op_rx.try_recv().unwrap();
        assert!(matches!(
            received,
            Op::Invoke { invocation, ref workflow, .. } if invocation == id && workflow == "novel"
        ));
    }

    #[test]
    fn test_send_after_close() {
        let (channel, pair) = EngineChannel::new();
        drop(pair);
        assert!(channel.is_closed());
        assert!(matches!(channel.shutdown(), Err(WorkflowError::ChannelError(_))));
    }

    #[tokio::test]
    async fn test_receive_event() {
        let (channel, pair) = EngineChannel::new();
        let id = InvocationId::new();

        pair.event_tx
            .send(WorkflowEvent::InvocationStarted {
                invocation: id,
                workflow: "novel".into(),
            })
            .unwrap();
        pair.event_tx
            .send(WorkflowEvent::InvocationCompleted {
                invocation: id,
                workflow: "novel".into(),
                output: None,
            })
            .unwrap();

        assert!(matches!(channel.try_recv(), Some(WorkflowEvent::InvocationStarted { .. })));
        assert!(matches!(
            channel.finished(id).await,
            Some(WorkflowEvent::InvocationCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_finished_holds_other_invocations() {
        let (channel, pair) = EngineChannel::new();
        let (first, second) = (InvocationId::new(), InvocationId::new());
        let completed = |invocation: InvocationId| WorkflowEvent::InvocationCompleted {
            invocation,
            workflow: "novel".into(),
            output: None,
        };

        pair.event_tx.send(completed(second)).unwrap();
        pair.event_tx.send(completed(first)).unwrap();

        let done = channel.finished(first).await.unwrap();
        assert_eq!(done.invocation(), first);
        let done = channel.finished(second).await.unwrap();
        assert_eq!(done.invocation(), second);
        assert!(channel.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_held_events_delivered_first() {
        let (channel, pair) = EngineChannel::new();
        let (first, second) = (InvocationId::new(), InvocationId::new());
        pair.event_tx
            .send(WorkflowEvent::InvocationStarted {
                invocation: second,
                workflow: "novel".into(),
            })
            .unwrap();
        pair.event_tx
            .send(WorkflowEvent::InvocationFailed {
                invocation: first,
                workflow: "novel".into(),
                error: "boom".into(),
            })
            .unwrap();

        assert!(channel.finished(first).await.is_some());
        assert!(matches!(
            channel.recv().await,
            Some(WorkflowEvent::InvocationStarted { invocation, .. }) if invocation == second
        ));
    }

    #[test]
    fn test_op_wire_format() {
        let op: Op = serde_json::from_value(json!({ "op": "shutdown" })).unwrap();
        assert!(matches!(op, Op::Shutdown));
    }
}
