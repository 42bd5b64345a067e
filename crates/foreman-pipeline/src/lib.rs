//! Workflow orchestration engine for Foreman.
//!
//! This crate turns declarative workflow definitions into executions:
//!
//! ```text
//! ┌──────────────┐   enqueue   ┌───────────┐  dequeue  ┌──────────────┐
//! │ TriggerSched │ ──────────► │ TaskQueue │ ────────► │ WorkerPool   │
//! │ cron / files │             └───────────┘           └──────┬───────┘
//! └──────────────┘                                            │
//!                                                             ▼
//! ┌──────────────┐  order   ┌────────────────┐  execute  ┌──────────────┐
//! │ ExecutionGraph│ ◄────── │ WorkflowEngine │ ────────► │ RunnerRegistry│
//! └──────────────┘          └───────┬────────┘           └──────┬───────┘
//!                                   │ status                    │ dynamic
//!                                   ▼                           ▼
//!                           ┌───────────────┐           ┌──────────────┐
//!                           │ WorkflowStore │           │ Lua sandbox  │
//!                           └───────────────┘           └──────────────┘
//! ```
//!
//! Generated modules for `dynamic` steps are produced ahead of time by the
//! [`ModuleGenerator`] and loaded from a [`ModuleStore`] at run time.

pub mod approval;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod generator;
pub mod graph;
pub mod inbox;
pub mod loader;
pub mod queue;
pub mod runner;
pub mod store;
pub mod trigger;
pub mod watch;
pub mod worker;

pub use approval::{ApprovalBook, ApprovalNotifier, ApprovalRecord, ApprovalRequest, ApprovalStatus, LogNotifier};
pub use context::ExecutionContext;
pub use definition::{
    CompositeMode, EdgeDefinition, NodeDefinition, StepDefinition, TriggerDefinition, Workflow, WorkflowFile,
    WorkflowStatus,
};
pub use engine::{EngineConfig, ExecutionObserver, NoopObserver, WorkflowEngine};
pub use error::{PipelineError, Result};
pub use generator::{GeneratedModule, ModuleGenerator, ModuleManifest, ModuleStore, sanitize_string, sanitize_value};
pub use graph::ExecutionGraph;
pub use inbox::{ApprovalInbox, Decision, InboxPaths};
pub use loader::{WatcherHandle, WorkflowEvent, WorkflowLoader};
pub use queue::{Delivery, ExecutionRequest, MemoryQueue, TaskQueue};
pub use runner::{
    RunnerDeps, RunnerRegistry, RunnerRegistryBuilder, StepResult, StepRunner, StepStatus, default_registry,
};
pub use store::{Execution, ExecutionStatus, MemoryStore, WorkflowStore};
pub use trigger::{SchedulerConfig, TriggerScheduler, should_fire};
pub use worker::{WorkerPool, process_request};
