// Core types and functionality for the Flowkeel workflow engine

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;
pub mod workflow;

pub use config::{EngineConfig, PollConfig, RetryConfig};
pub use engine::{ClaimOutcome, CompletionOutcome, FailureOutcome, FlowEngine};
pub use error::{DefinitionError, EngineError};
pub use handler::{handler_fn, HandlerRegistry, TaskHandler};
pub use queue::{Queue, RedbQueue};
pub use store::{FlowStore, RedbStore, StateReader, StateWriter};
pub use types::*;
pub use worker::{Worker, WorkerConfig, WorkerStats};
pub use workflow::{StepKind, StepSpec, WorkflowDefinition};
