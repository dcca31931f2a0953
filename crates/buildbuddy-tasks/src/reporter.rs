//! Build execution reporting

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Why a step is about to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReason {
    /// No consistent persisted output exists
    Inconsistent,
    /// The step runs on every build
    AlwaysRun,
    /// At least one dependency changed
    Changed,
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inconsistent => write!(f, "no consistent output"),
            Self::AlwaysRun => write!(f, "always run"),
            Self::Changed => write!(f, "inputs changed"),
        }
    }
}

/// Events emitted during a build
#[derive(Debug, Clone)]
pub enum BuildEvent {
    /// A source folder was hashed
    SourceHashed { id: String, files: usize },
    /// A step is about to run
    StepStarted { id: String, reason: RunReason },
    /// A step was up to date and its previous output reused
    StepSkipped { id: String },
    /// A step published new output
    StepPublished {
        id: String,
        files: usize,
        duration: Duration,
    },
    /// A step kept its previous output; its record was invalidated
    StepDeclined { id: String },
    /// A step failed
    StepFailed {
        id: String,
        error: String,
        duration: Duration,
    },
    /// The whole build finished successfully
    BuildCompleted { outputs: usize, duration: Duration },
}

impl BuildEvent {
    /// Identity the event refers to, if any
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::SourceHashed { id, .. }
            | Self::StepStarted { id, .. }
            | Self::StepSkipped { id }
            | Self::StepPublished { id, .. }
            | Self::StepDeclined { id }
            | Self::StepFailed { id, .. } => Some(id.as_str()),
            Self::BuildCompleted { .. } => None,
        }
    }
}

/// Trait for reporting build progress
pub trait BuildReporter: Send + Sync {
    /// Handle a build event
    fn report(&self, event: &BuildEvent);
}

/// Reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl BuildReporter for TracingReporter {
    fn report(&self, event: &BuildEvent) {
        match event {
            BuildEvent::SourceHashed { id, files } => {
                tracing::debug!("Hashed source {} ({} files)", id, files);
            }
            BuildEvent::StepStarted { id, reason } => {
                tracing::info!("Running {}: {}", id, reason);
            }
            BuildEvent::StepSkipped { id } => {
                tracing::info!("{} is up to date", id);
            }
            BuildEvent::StepPublished {
                id,
                files,
                duration,
            } => {
                tracing::info!(
                    "{} published {} files in {:.1}s",
                    id,
                    files,
                    duration.as_secs_f64()
                );
            }
            BuildEvent::StepDeclined { id } => {
                tracing::warn!("{} kept its previous output; it will be verified next build", id);
            }
            BuildEvent::StepFailed {
                id,
                error,
                duration,
            } => {
                tracing::error!("{} failed after {:.1}s: {}", id, duration.as_secs_f64(), error);
            }
            BuildEvent::BuildCompleted { outputs, duration } => {
                tracing::info!(
                    "Build complete: {} outputs ({:.1}s)",
                    outputs,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<BuildEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<BuildEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Identities of the steps that ran, in the order they started
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BuildEvent::StepStarted { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Identities of the steps that were skipped
    pub fn skipped(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BuildEvent::StepSkipped { id } => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Forget everything collected so far
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl BuildReporter for CollectingReporter {
    fn report(&self, event: &BuildEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
