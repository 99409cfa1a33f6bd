//! Runtime: job orchestration for paper workflows.
//!
//! Layers, leaves first: the capability [`Invoker`], the [`TaskRegistry`] and
//! [`EventBus`], the [`WorkflowEngine`] composing extract, translate and analyze
//! stages, the [`BatchController`] driving many workflows under bounded
//! parallelism, and the [`Orchestrator`] facade the HTTP layer talks to.

pub mod backends;
pub mod batch;
pub mod events;
pub mod invoker;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use backends::default_invoker;
pub use batch::{
    BatchController, BatchItem, BatchOptions, BatchReport, BatchStats, InvalidItem, ItemResult,
    ProgressCallback,
};
pub use events::{Event, EventBus, EventReceiver};
pub use invoker::{
    Capability, CapabilityError, CapabilityErrorKind, CapabilityKind, CapabilityOutput,
    CapabilityParams, Invoker,
};
pub use orchestrator::{
    CleanupOutcome, ContentView, Orchestrator, ProcessOutcome, ReportView, UploadRecord,
};
pub use registry::{CancelOutcome, Task, TaskFilter, TaskRegistry, TaskStats, TaskStatus, TaskUpdate};
pub use workflow::{Workflow, WorkflowEngine, WorkflowOptions, WorkflowRequest, WorkflowResult};
