// Workflow definitions and their validation

pub mod dag;
pub mod definition;

pub use dag::WorkflowDag;
pub use definition::{
    StepKind, StepSpec, WorkflowDefinition, MAX_BASE_DELAY_SECS, MAX_TIMEOUT_SECS,
    RESERVED_STEP_SLUGS,
};
