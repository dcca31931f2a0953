//! buildbuddy tasks - dependency-ordered asynchronous execution
//!
//! [`TaskGraph`] runs named asynchronous tasks once each, as soon as their
//! dependencies completed. [`BuildExecutor`] builds on it to run build steps
//! incrementally: a step only runs when its persisted output is missing or
//! stale, or when one of its dependencies changed.

pub mod checksum;
pub mod executor;
pub mod graph;
pub mod reporter;
pub mod step;

pub use checksum::ChecksumStatus;
pub use executor::{BuildExecutor, BuildSummaries, StepSummary};
pub use graph::{TaskFuture, TaskGraph};
pub use reporter::{BuildEvent, BuildReporter, CollectingReporter, RunReason, TracingReporter};
pub use step::{
    AlwaysRun, BuildStep, BuildStepArgument, BuildStepArguments, BuildStepContext, BuildStepResult,
};
