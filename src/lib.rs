//! # Schemer
//!
//! Agent workflow orchestration - composing opaque agents into workflows.
//!
//! An agent is a black box: named inputs in, one named output out. This
//! crate wires agents together with explicit control flow and threads one
//! shared [`Scope`] through every node of an invocation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                  ORCHESTRATOR  (Op in, WorkflowEvent out)            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │   Registry   │  │ Invocations  │  │ Cancellation │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │  Workflow::run_scope (one Scope each)
//!                              ▼
//!   ┌──────────┐ ┌──────────┐ ┌─────────────┐ ┌──────┐ ┌────────────┐ ┌─────────┐
//!   │ Sequence │ │ Parallel │ │ Conditional │ │ Loop │ │ Supervisor │ │ Planner │
//!   └────┬─────┘ └────┬─────┘ └──────┬──────┘ └──┬───┘ └─────┬──────┘ └────┬────┘
//!        └────────────┴──────────────┼───────────┴───────────┴─────────────┘
//!                                    ▼
//!                 ┌────────────────────────────────────┐
//!                 │  AgentNode  │  HumanInTheLoop      │
//!                 └────────────────────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Scope**: Keyed state shared by every node of one invocation
//! - **Agent**: An opaque unit of work behind the [`Agent`] trait
//! - **Node**: Anything that runs against a scope; combinators nest nodes
//! - **Recovery**: Per-node policy for failures (abort, retry, fallback)
//! - **Workflow**: A named root node; each invocation gets a fresh scope
//!
//! ## Example
//!
//! ```no_run
//! use schemer::{AgentNode, Arguments, FnAgent, Sequence, Workflow};
//! use serde_json::json;
//!
//! # async fn demo() -> schemer::Result<()> {
//! let writer = FnAgent::new("creative-writer", "story", |args: Arguments| async move {
//!     Ok(json!(format!("a story about {}", args.get_str("topic").unwrap_or("?"))))
//! })
//! .input("topic");
//!
//! let novel = Sequence::builder()
//!     .then(AgentNode::new(writer))
//!     .output_key("story")
//!     .build()?;
//!
//! let story = Workflow::new("novel", novel)
//!     .invoke(Arguments::new().with("topic", json!("dragons")))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod channel;
pub mod conditional;
pub mod config;
pub mod error;
pub mod events;
pub mod human;
pub mod looping;
pub mod node;
pub mod orchestrator;
pub mod parallel;
pub mod planner;
pub mod recovery;
pub mod scope;
pub mod sequence;
pub mod supervisor;
pub mod workflow;

pub use agent::{Agent, AgentNode, Arguments, FnAgent, InputSpec, ValueKind};
pub use channel::{ChannelPair, EngineChannel, Op};
pub use conditional::{Conditional, NoMatchPolicy, Predicate};
pub use config::EngineConfig;
pub use error::{Result, WorkflowError};
pub use events::WorkflowEvent;
pub use human::{
    ConsoleChannel, HumanChannel, HumanInTheLoop, HumanMode, HumanQueue, HumanRequest,
    PendingResponse, QueueChannel,
};
pub use looping::{CapPolicy, Loop, LoopReport, LoopState};
pub use node::{Node, NodeDescriptor, NodeRef};
pub use orchestrator::Orchestrator;
pub use parallel::Parallel;
pub use planner::{GoalOriented, Planner, PlanningStrategy};
pub use recovery::{Fallback, RecoveryPolicy};
pub use scope::{AgentInvocation, InvocationId, Scope, ScopeSnapshot};
pub use sequence::Sequence;
pub use supervisor::{
    ContextStrategy, Delegation, DelegationRequest, DelegationStrategy, ResponseStrategy,
    Summarizer, Supervisor, SupervisorStep,
};
pub use workflow::{Workflow, WorkflowResult};
