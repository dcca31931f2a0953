//! Build step contract

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use buildbuddy_core::hash::Checksums;

use crate::checksum::ChecksumStatus;

/// Folders a step works with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStepContext {
    /// The step's last published output, if it is still consistent
    pub previous: Option<PathBuf>,
    /// Fresh, empty folder to publish into
    pub next: PathBuf,
}

/// What a step sees of one direct dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStepArgument {
    /// Folder holding the dependency's output
    pub folder: PathBuf,
    /// Current digests of the dependency's files
    pub checksums: Checksums,
    /// Changes since the step last ran
    pub status: ChecksumStatus,
}

impl BuildStepArgument {
    /// Whether the dependency changed since the step last ran
    pub fn is_changed(&self) -> bool {
        self.status.is_changed()
    }
}

/// Arguments keyed by dependency identity
pub type BuildStepArguments = IndexMap<String, BuildStepArgument>;

/// Outcome of a successful step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStepResult {
    /// Whether the `next` folder holds new content to publish
    pub published: bool,
}

impl BuildStepResult {
    /// New content was written to the `next` folder
    pub fn published() -> Self {
        Self { published: true }
    }

    /// Nothing to publish; keep the previous output
    pub fn declined() -> Self {
        Self { published: false }
    }
}

/// A unit of build work.
///
/// Implementations write their result into `context.next` and may spawn
/// additional work on `handle`. Any error aborts the step; the executor
/// discards the staged folder.
#[async_trait]
pub trait BuildStep: Send + Sync {
    /// Run even when no dependency changed
    fn is_always_run(&self) -> bool {
        false
    }

    /// Produce the step's output
    async fn apply(
        &self,
        handle: &Handle,
        context: &BuildStepContext,
        arguments: &BuildStepArguments,
    ) -> anyhow::Result<BuildStepResult>;
}

#[async_trait]
impl<S: BuildStep + ?Sized> BuildStep for Arc<S> {
    fn is_always_run(&self) -> bool {
        (**self).is_always_run()
    }

    async fn apply(
        &self,
        handle: &Handle,
        context: &BuildStepContext,
        arguments: &BuildStepArguments,
    ) -> anyhow::Result<BuildStepResult> {
        (**self).apply(handle, context, arguments).await
    }
}

/// Wraps a step so that it runs on every build
#[derive(Debug, Clone)]
pub struct AlwaysRun<S>(pub S);

#[async_trait]
impl<S: BuildStep> BuildStep for AlwaysRun<S> {
    fn is_always_run(&self) -> bool {
        true
    }

    async fn apply(
        &self,
        handle: &Handle,
        context: &BuildStepContext,
        arguments: &BuildStepArguments,
    ) -> anyhow::Result<BuildStepResult> {
        self.0.apply(handle, context, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl BuildStep for Noop {
        async fn apply(
            &self,
            _handle: &Handle,
            _context: &BuildStepContext,
            _arguments: &BuildStepArguments,
        ) -> anyhow::Result<BuildStepResult> {
            Ok(BuildStepResult::declined())
        }
    }

    #[test]
    fn test_always_run_wrapper() {
        assert!(!Noop.is_always_run());
        assert!(AlwaysRun(Noop).is_always_run());
        assert!(Arc::new(AlwaysRun(Noop)).is_always_run());
    }

    #[tokio::test]
    async fn test_arc_step_delegates() {
        let step: Arc<dyn BuildStep> = Arc::new(Noop);
        let context = BuildStepContext {
            previous: None,
            next: PathBuf::from("next"),
        };
        let result = step
            .apply(&Handle::current(), &context, &BuildStepArguments::new())
            .await
            .unwrap();
        assert!(!result.published);
    }

    #[test]
    fn test_argument_change_follows_status() {
        let argument = BuildStepArgument {
            folder: PathBuf::from("dep"),
            checksums: Checksums::new(),
            status: ChecksumStatus::default(),
        };
        assert!(!argument.is_changed());
    }
}
