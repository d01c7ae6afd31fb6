//! # Blockflow
//!
//! A workflow execution engine: user-defined DAGs of heterogeneous
//! blocks — LLM agent steps, HTTP calls, tool invocations,
//! conditionals, loops, and data transforms — run with bounded
//! parallelism, streaming status updates, typed error classification,
//! and partial-failure semantics.
//!
//! ## Core Concepts
//!
//! - **[`Workflow`]** — blocks + connections + input variables. Edges
//!   may carry a port name (`true`, `false`, `loop_body`, `done`, case
//!   labels) for branch routing.
//! - **[`WorkflowEngine`]** — resolves dependencies, dispatches ready
//!   blocks as concurrent tasks under a semaphore, streams
//!   [`StatusUpdate`]s, and assembles the final [`ExecutionResult`].
//! - **[`BlockExecutor`]** — object-safe trait, one implementation per
//!   block type, registered in an [`ExecutorRegistry`].
//! - **[`RunContext`]** — collaborator handles (tools, providers,
//!   credentials, files), cancellation, status sink, circuit breaker.
//! - **Agent blocks** — `llm_inference` drives a full agent loop:
//!   streaming SSE, tool calling, structured-output validation, and
//!   retry-with-backoff (see [`agent`]).
//!
//! ## Quick Start
//!
//! ```no_run
//! use blockflow::collab::mock::{StaticCatalog, StaticToolRegistry};
//! use blockflow::{
//!     Block, BlockType, Connection, RunContext, Workflow, WorkflowEngine,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> blockflow::Result<()> {
//!     let ctx = RunContext::builder(
//!         Arc::new(StaticToolRegistry::new()),
//!         Arc::new(StaticCatalog::new()),
//!     )
//!     .build();
//!
//!     let workflow = Workflow {
//!         id: "hello".into(),
//!         blocks: vec![
//!             Block::new("greet", BlockType::Variable)
//!                 .with_config("variableName", json!("name"))
//!                 .with_config("defaultValue", json!("world")),
//!             Block::new("shape", BlockType::Transform).with_config(
//!                 "operations",
//!                 json!([{"op": "template", "key": "message",
//!                         "template": "hello {{response}}"}]),
//!             ),
//!         ],
//!         connections: vec![Connection::new("greet", "shape")],
//!         variables: vec![],
//!         workflow_timeout: None,
//!         max_parallel_blocks: None,
//!         workflow_model_id: None,
//!     };
//!
//!     let engine = WorkflowEngine::new(ctx);
//!     let result = engine.execute(&workflow, Default::default()).await?;
//!     println!("{:?}", result.status);
//!     Ok(())
//! }
//! ```
//!
//! Failure semantics: a failed block never aborts the run — its
//! dependents simply never start, independent branches continue, and
//! the run ends `completed`, `partial`, or `failed` based on block
//! outcomes.

pub mod agent;
pub mod backoff;
pub mod breaker;
pub mod checker;
pub mod collab;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod exec;
pub mod llm;
pub mod model;
pub mod response;
pub mod template;
pub mod tracker;

pub use backoff::{RetryOn, RetryPolicy};
pub use breaker::CircuitBreaker;
pub use context::{AgentSettings, RunContext, RunContextBuilder};
pub use engine::{EngineConfig, WorkflowEngine};
pub use error::{classify, Classified, EngineError, ErrorCategory, ErrorSource, Result};
pub use events::{StatusKind, StatusSender, StatusUpdate};
pub use exec::{BlockExecutor, ExecutorRegistry};
pub use model::{
    Block, BlockState, BlockStatus, BlockType, Connection, ExecutionResult, JsonMap, RetrySpec,
    RunStatus, Variable, Workflow,
};
pub use response::{shape_response, ApiResponse};
pub use tracker::{ExecutionTracker, RunPermit};
