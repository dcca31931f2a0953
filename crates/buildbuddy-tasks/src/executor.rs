//! Incremental build executor
//!
//! Specializes [`TaskGraph`] to build steps. Every step identity owns the
//! folder `<root>/<identity>`:
//!
//! ```text
//! <root>/<identity>/output/                      published artifact tree
//! <root>/<identity>/checksum/checksums           digests of output/
//! <root>/<identity>/checksum/checksums.<dep>     digests of <dep> as last seen
//! ```
//!
//! A step only runs when its persisted output no longer matches its record,
//! when it asks to always run, or when a dependency changed since the record
//! was written. Steps write into a staging folder inside `<root>` that is
//! renamed into place once it holds both the output and its record.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use buildbuddy_core::config::identity_problem;
use buildbuddy_core::error::{BuildError, GraphError, Result};
use buildbuddy_core::hash::{self, Checksums, HashFunction};

use crate::checksum::ChecksumStatus;
use crate::graph::TaskGraph;
use crate::reporter::{BuildEvent, BuildReporter, RunReason, TracingReporter};
use crate::step::{BuildStep, BuildStepArgument, BuildStepArguments, BuildStepContext};

const OUTPUT: &str = "output";
const CHECKSUM: &str = "checksum";
const CHECKSUMS: &str = "checksums";
const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// Published state of a source or step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    /// Folder holding the output
    pub folder: PathBuf,
    /// Digests of every file in `folder`
    pub checksums: Checksums,
}

/// Summaries keyed by identity
pub type BuildSummaries = BTreeMap<String, StepSummary>;

/// State shared by every node of one executor
struct Workspace {
    root: PathBuf,
    hash: Arc<dyn HashFunction>,
    reporter: Arc<dyn BuildReporter>,
}

/// Runs sources and build steps, skipping steps whose inputs are unchanged.
///
/// The result of [`BuildExecutor::execute`] holds the summaries of sink
/// identities only (see [`TaskGraph`]).
pub struct BuildExecutor {
    workspace: Arc<Workspace>,
    graph: TaskGraph<BuildSummaries>,
}

impl BuildExecutor {
    /// Create an executor persisting state below `root`
    pub fn new(root: impl Into<PathBuf>, hash: Arc<dyn HashFunction>) -> Self {
        Self::with_reporter(root, hash, Arc::new(TracingReporter))
    }

    /// Create an executor reporting progress to `reporter`
    pub fn with_reporter(
        root: impl Into<PathBuf>,
        hash: Arc<dyn HashFunction>,
        reporter: Arc<dyn BuildReporter>,
    ) -> Self {
        Self {
            workspace: Arc::new(Workspace {
                root: root.into(),
                hash,
                reporter,
            }),
            graph: TaskGraph::new(|mut left: BuildSummaries, right: BuildSummaries| {
                left.extend(right);
                left
            }),
        }
    }

    /// Folder holding every step's persisted state
    pub fn root(&self) -> &Path {
        &self.workspace.root
    }

    /// The underlying task graph
    pub fn graph(&self) -> &TaskGraph<BuildSummaries> {
        &self.graph
    }

    /// Register a source folder. Sources are hashed on every build.
    pub fn add_source(&mut self, id: impl Into<String>, path: impl Into<PathBuf>) -> Result<()> {
        let id = checked(id.into())?;
        let task = self.wrap_source(&id, path.into());
        self.graph.add(id, task, Vec::<String>::new())
    }

    /// Point a registered source at a different folder
    pub fn replace_source(&mut self, id: &str, path: impl Into<PathBuf>) -> Result<()> {
        let task = self.wrap_source(id, path.into());
        self.graph.replace(id, task)
    }

    /// Register a step depending on the given identities
    pub fn add_step<S, I, D>(&mut self, id: impl Into<String>, step: S, dependencies: I) -> Result<()>
    where
        S: BuildStep + 'static,
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        let id = checked(id.into())?;
        let task = self.wrap_step(&id, Arc::new(step));
        self.graph.add(id, task, dependencies)
    }

    /// Register a step depending on everything registered so far
    pub fn add_step_at_end<S>(&mut self, id: impl Into<String>, step: S) -> Result<()>
    where
        S: BuildStep + 'static,
    {
        let dependencies: Vec<String> = self.graph.identities().map(String::from).collect();
        self.add_step(id, step, dependencies)
    }

    /// Swap the definition of a registered step, keeping its dependencies
    pub fn replace_step<S>(&mut self, id: &str, step: S) -> Result<()>
    where
        S: BuildStep + 'static,
    {
        let task = self.wrap_step(id, Arc::new(step));
        self.graph.replace(id, task)
    }

    /// Run the build once on `handle`
    #[instrument(skip_all, fields(root = %self.workspace.root.display()))]
    pub async fn execute(&self, handle: &Handle) -> Result<BuildSummaries> {
        let started = Instant::now();
        sweep_stale(&self.workspace.root)?;

        let summaries = self.graph.execute(handle, BuildSummaries::new()).await?;

        self.workspace.reporter.report(&BuildEvent::BuildCompleted {
            outputs: summaries.len(),
            duration: started.elapsed(),
        });
        Ok(summaries)
    }

    /// Remove the persisted state of one identity
    pub fn clean(&self, id: &str) -> Result<bool> {
        let id = checked(id.to_string())?;
        let location = self.workspace.root.join(&id);
        if !location.exists() {
            return Ok(false);
        }
        info!(step = %id, "removing persisted state");
        fs::remove_dir_all(&location)?;
        Ok(true)
    }

    fn wrap_source(
        &self,
        id: &str,
        path: PathBuf,
    ) -> impl Fn(Handle, BuildSummaries) -> BoxFuture<'static, Result<BuildSummaries>> + Send + Sync + 'static
    {
        let workspace = self.workspace.clone();
        let id = id.to_string();
        move |handle, _states| run_source(workspace.clone(), id.clone(), path.clone(), handle).boxed()
    }

    fn wrap_step(
        &self,
        id: &str,
        step: Arc<dyn BuildStep>,
    ) -> impl Fn(Handle, BuildSummaries) -> BoxFuture<'static, Result<BuildSummaries>> + Send + Sync + 'static
    {
        let workspace = self.workspace.clone();
        let id = id.to_string();
        move |handle, states| {
            run_step(workspace.clone(), id.clone(), step.clone(), handle, states).boxed()
        }
    }
}

/// Identities become folder names below the root
fn checked(id: String) -> Result<String> {
    match identity_problem(&id) {
        Some(message) => Err(GraphError::InvalidIdentity {
            id,
            message: message.to_string(),
        }
        .into()),
        None => Ok(id),
    }
}

/// Paths of one identity's persisted state
struct Layout {
    location: PathBuf,
    output: PathBuf,
    checksum: PathBuf,
}

impl Layout {
    fn new(root: &Path, id: &str) -> Self {
        let location = root.join(id);
        Self {
            output: location.join(OUTPUT),
            checksum: location.join(CHECKSUM),
            location,
        }
    }

    fn record(checksum: &Path) -> PathBuf {
        checksum.join(CHECKSUMS)
    }

    fn snapshot(checksum: &Path, dependency: &str) -> PathBuf {
        checksum.join(format!("{}.{}", CHECKSUMS, dependency))
    }
}

/// What was found on disk before deciding whether to run
struct Inspection {
    consistent: bool,
    current: Checksums,
    arguments: BuildStepArguments,
}

async fn blocking<T, F>(handle: &Handle, id: &str, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    handle
        .spawn_blocking(work)
        .await
        .map_err(|e| BuildError::Panicked {
            id: id.to_string(),
            message: e.to_string(),
        })?
}

async fn run_source(
    workspace: Arc<Workspace>,
    id: String,
    path: PathBuf,
    handle: Handle,
) -> Result<BuildSummaries> {
    let hash = workspace.hash.clone();
    let folder = path.clone();
    let checksums = blocking(&handle, &id, move || {
        hash::hash_tree(&folder, hash.as_ref()).map_err(BuildError::from)
    })
    .await
    .map_err(|e| match e {
        BuildError::Io(e) => BuildError::step(
            id.clone(),
            anyhow::anyhow!("cannot hash source folder {}: {}", path.display(), e),
        ),
        other => other,
    })?;

    workspace.reporter.report(&BuildEvent::SourceHashed {
        id: id.clone(),
        files: checksums.len(),
    });
    Ok(BTreeMap::from([(
        id,
        StepSummary {
            folder: path,
            checksums,
        },
    )]))
}

#[instrument(skip(workspace, step, handle, states))]
async fn run_step(
    workspace: Arc<Workspace>,
    id: String,
    step: Arc<dyn BuildStep>,
    handle: Handle,
    states: BuildSummaries,
) -> Result<BuildSummaries> {
    let layout = Arc::new(Layout::new(&workspace.root, &id));

    let inspection = {
        let layout = layout.clone();
        let hash = workspace.hash.clone();
        let states = states.clone();
        blocking(&handle, &id, move || inspect(&layout, &states, hash.as_ref())).await?
    };
    let Inspection {
        consistent,
        current,
        arguments,
    } = inspection;

    let reason = if !consistent {
        Some(RunReason::Inconsistent)
    } else if step.is_always_run() {
        Some(RunReason::AlwaysRun)
    } else if arguments.values().any(BuildStepArgument::is_changed) {
        Some(RunReason::Changed)
    } else {
        None
    };

    let Some(reason) = reason else {
        debug!("inputs unchanged, reusing output");
        workspace
            .reporter
            .report(&BuildEvent::StepSkipped { id: id.clone() });
        return Ok(summary(id, layout.output.clone(), current));
    };

    let started = Instant::now();
    let staging = {
        let root = workspace.root.clone();
        let stage_id = id.clone();
        blocking(&handle, &id, move || stage(&root, &stage_id)).await?
    };
    let context = BuildStepContext {
        previous: consistent.then(|| layout.output.clone()),
        next: staging.path().join(OUTPUT),
    };
    debug!(reason = %reason, next = %context.next.display(), "running step");
    workspace.reporter.report(&BuildEvent::StepStarted {
        id: id.clone(),
        reason,
    });

    let outcome: Result<Checksums> = match step.apply(&handle, &context, &arguments).await {
        Err(e) => {
            blocking(&handle, &id, move || {
                discard(staging);
                Ok(())
            })
            .await
            .and_then(|()| Err(BuildError::step(id.clone(), e)))
        }
        Ok(result) if result.published => {
            let hash = workspace.hash.clone();
            let root = workspace.root.clone();
            let publish_layout = layout.clone();
            let publish_id = id.clone();
            blocking(&handle, &id, move || {
                publish(&root, &publish_id, &publish_layout, staging, &states, hash.as_ref())
            })
            .await
            .map(|checksums| {
                info!(files = checksums.len(), "published output");
                workspace.reporter.report(&BuildEvent::StepPublished {
                    id: id.clone(),
                    files: checksums.len(),
                    duration: started.elapsed(),
                });
                checksums
            })
        }
        Ok(_) if consistent => {
            let invalidated = layout.clone();
            blocking(&handle, &id, move || {
                discard(staging);
                invalidate(&invalidated)
            })
            .await
            .map(|()| {
                warn!("step declined to publish, checksum record invalidated");
                workspace
                    .reporter
                    .report(&BuildEvent::StepDeclined { id: id.clone() });
                current
            })
        }
        Ok(_) => {
            blocking(&handle, &id, move || {
                discard(staging);
                Ok(())
            })
            .await
            .and_then(|()| Err(BuildError::NotPublished(id.clone())))
        }
    };

    match outcome {
        Ok(checksums) => Ok(summary(id, layout.output.clone(), checksums)),
        Err(e) => {
            workspace.reporter.report(&BuildEvent::StepFailed {
                id,
                error: e.to_string(),
                duration: started.elapsed(),
            });
            Err(e)
        }
    }
}

fn summary(id: String, folder: PathBuf, checksums: Checksums) -> BuildSummaries {
    BTreeMap::from([(id, StepSummary { folder, checksums })])
}

/// Read the persisted record and diff every dependency against its snapshot
fn inspect(layout: &Layout, states: &BuildSummaries, hash: &dyn HashFunction) -> Result<Inspection> {
    let current = if layout.location.exists() {
        read_record(&Layout::record(&layout.checksum))
    } else {
        None
    };
    let consistent = match &current {
        Some(checksums) => hash::are_consistent(&layout.output, checksums, hash)?,
        None => false,
    };
    debug!(
        exists = layout.location.exists(),
        consistent, "inspected persisted state"
    );

    let mut arguments = BuildStepArguments::new();
    for (dependency, summary) in states {
        let snapshot = if consistent {
            read_record(&Layout::snapshot(&layout.checksum, dependency))
        } else {
            None
        };
        let status = match snapshot {
            Some(previous) => ChecksumStatus::diff(&previous, &summary.checksums),
            None => ChecksumStatus::added(summary.checksums.keys()),
        };
        arguments.insert(
            dependency.clone(),
            BuildStepArgument {
                folder: summary.folder.clone(),
                checksums: summary.checksums.clone(),
                status,
            },
        );
    }

    Ok(Inspection {
        consistent,
        current: current.unwrap_or_default(),
        arguments,
    })
}

/// A missing or unreadable record means the state cannot be trusted
fn read_record(path: &Path) -> Option<Checksums> {
    match hash::try_read_checksums(path) {
        Ok(record) => record,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable checksum record");
            None
        }
    }
}

/// Create a private staging folder with an empty `output` inside `root`
fn stage(root: &Path, id: &str) -> Result<TempDir> {
    fs::create_dir_all(root)?;
    let staging = tempfile::Builder::new()
        .prefix(&format!("{}{}-", STAGING_PREFIX, id))
        .tempdir_in(root)?;
    fs::create_dir(staging.path().join(OUTPUT))?;
    Ok(staging)
}

fn discard(staging: TempDir) {
    let path = staging.path().to_path_buf();
    if let Err(e) = staging.close() {
        warn!(path = %path.display(), error = %e, "failed to remove staging folder");
    }
}

/// Complete the staged tree with its record, then swap it into place.
///
/// Nothing under the stable location is touched until the staged tree is
/// complete. The previous tree is moved aside before the staged one is moved
/// in, and restored if that second move fails.
fn publish(
    root: &Path,
    id: &str,
    layout: &Layout,
    staging: TempDir,
    states: &BuildSummaries,
    hash: &dyn HashFunction,
) -> Result<Checksums> {
    let checksums = hash::hash_tree(&staging.path().join(OUTPUT), hash)?;

    let record = staging.path().join(CHECKSUM);
    fs::create_dir(&record)?;
    for (dependency, summary) in states {
        hash::write_checksums(&Layout::snapshot(&record, dependency), &summary.checksums)?;
    }
    hash::write_checksums(&Layout::record(&record), &checksums)?;

    swap(root, id, &layout.location, staging.path())?;

    // The staging guard now points at a path that no longer exists; dropping
    // it is a no-op.
    drop(staging);
    Ok(checksums)
}

/// Move `staged` to `location`, retiring whatever was there.
///
/// The previous tree waits in `<root>/.retired-<id>-*/<id>` until the staged
/// tree is in place. If the process dies in between, [`sweep_stale`] moves it
/// back on the next build.
fn swap(root: &Path, id: &str, location: &Path, staged: &Path) -> Result<()> {
    if !location.exists() {
        fs::rename(staged, location)?;
        return Ok(());
    }

    let retired = tempfile::Builder::new()
        .prefix(&format!("{}{}-", RETIRED_PREFIX, id))
        .tempdir_in(root)?;
    let previous = retired.path().join(id);
    fs::rename(location, &previous)?;
    if let Err(e) = fs::rename(staged, location) {
        if let Err(restore) = fs::rename(&previous, location) {
            warn!(error = %restore, "failed to restore previous output");
            // Leave the retired tree on disk for the next sweep.
            let _ = retired.keep();
        }
        return Err(e.into());
    }
    if let Err(e) = retired.close() {
        warn!(error = %e, "failed to remove previous output");
    }
    Ok(())
}

/// Drop the checksum record so the next build re-verifies the step
fn invalidate(layout: &Layout) -> Result<()> {
    match fs::remove_dir_all(&layout.checksum) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Clean up after an interrupted build.
///
/// Staging folders are removed. A retired tree whose identity has no folder
/// left is moved back into place, so a crash in the middle of [`swap`] never
/// loses the last published output.
fn sweep_stale(root: &Path) -> Result<()> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(RETIRED_PREFIX) {
            restore_retired(root, &entry.path())?;
        }
        if name.starts_with(STAGING_PREFIX) || name.starts_with(RETIRED_PREFIX) {
            debug!(path = %entry.path().display(), "removing stale folder");
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

fn restore_retired(root: &Path, wrapper: &Path) -> Result<()> {
    for entry in fs::read_dir(wrapper)? {
        let entry = entry?;
        let location = root.join(entry.file_name());
        if !location.exists() {
            warn!(
                location = %location.display(),
                "restoring output retired by an interrupted build"
            );
            fs::rename(entry.path(), &location)?;
        }
    }
    Ok(())
}
