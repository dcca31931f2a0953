//! Dependency-ordered concurrent task graph
//!
//! A [`TaskGraph`] is a registry of named nodes. Each node holds an
//! asynchronous task and the identities of the nodes it depends on. Because a
//! dependency must be registered before its dependent, registration order is
//! a topological order and the graph can never contain a cycle.
//!
//! Executing the graph runs every node exactly once. A node starts as soon as
//! all of its direct dependencies finished and receives
//! `merge(initial, fold(dependency outputs))`, folded in declaration order.
//! The overall result is `merge(initial, fold(sink outputs))` in registration
//! order, where a sink is a node nothing depends on.
//!
//! Only sinks surface in the overall result. A node that is consumed solely by
//! other nodes contributes to the final value only through whatever its
//! dependents chose to carry forward.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, try_join_all, BoxFuture, FutureExt, Shared};
use indexmap::{IndexMap, IndexSet};
use tokio::runtime::Handle;
use tracing::{debug, instrument, trace, warn};

use buildbuddy_core::error::{BuildError, GraphError, Result};

/// Future returned by a node's task
pub type TaskFuture<R> = BoxFuture<'static, Result<R>>;

/// Work of a single node: receives the runtime handle and the merged input
pub type Task<R> = Arc<dyn Fn(Handle, R) -> TaskFuture<R> + Send + Sync>;

/// Associative combination of two results
pub type Merge<R> = Arc<dyn Fn(R, R) -> R + Send + Sync>;

struct Registration<R> {
    task: Task<R>,
    dependencies: IndexSet<String>,
}

/// Registry of named asynchronous tasks executed in dependency order.
///
/// Registration is not synchronized with execution: callers finish
/// registering and replacing tasks before calling [`TaskGraph::execute`].
pub struct TaskGraph<R> {
    merge: Merge<R>,
    registrations: IndexMap<String, Registration<R>>,
}

impl<R> TaskGraph<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Create an empty graph combining results with `merge`
    pub fn new(merge: impl Fn(R, R) -> R + Send + Sync + 'static) -> Self {
        Self {
            merge: Arc::new(merge),
            registrations: IndexMap::new(),
        }
    }

    /// Register a node.
    ///
    /// Fails without modifying the graph if `id` is taken or a dependency is
    /// not registered yet.
    pub fn add<F, Fut, I, S>(&mut self, id: impl Into<String>, task: F, dependencies: I) -> Result<()>
    where
        F: Fn(Handle, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        if self.registrations.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id).into());
        }

        let dependencies: IndexSet<String> = dependencies.into_iter().map(Into::into).collect();
        if let Some(missing) = dependencies
            .iter()
            .find(|d| !self.registrations.contains_key(*d))
        {
            return Err(GraphError::UnknownDependency {
                id,
                dependency: missing.clone(),
            }
            .into());
        }

        debug!(node = %id, dependencies = dependencies.len(), "registered node");
        self.registrations.insert(
            id,
            Registration {
                task: box_task(task),
                dependencies,
            },
        );
        Ok(())
    }

    /// Swap the task of a registered node, keeping its dependencies
    pub fn replace<F, Fut>(&mut self, id: &str, task: F) -> Result<()>
    where
        F: Fn(Handle, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let registration = self
            .registrations
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))?;
        registration.task = box_task(task);
        debug!(node = %id, "replaced node task");
        Ok(())
    }

    /// Run every node once and fold the sink outputs into `initial`.
    ///
    /// Node tasks are spawned on `handle`. The returned future only waits on
    /// them; it never blocks a worker thread. If a node fails, its dependents
    /// never start and the first failure reaching a sink is returned, but only
    /// after every other node has settled. Nothing spawned by this call is
    /// still running once the returned future resolves.
    #[instrument(skip_all, fields(nodes = self.registrations.len()))]
    pub fn execute(&self, handle: &Handle, initial: R) -> TaskFuture<R> {
        let mut scheduled: Vec<Shared<TaskFuture<R>>> = Vec::with_capacity(self.registrations.len());

        for (id, registration) in &self.registrations {
            let dependencies: Vec<_> = registration
                .dependencies
                .iter()
                .filter_map(|d| self.registrations.get_index_of(d))
                .map(|index| scheduled[index].clone())
                .collect();

            let node = run_node(
                id.clone(),
                registration.task.clone(),
                dependencies,
                self.merge.clone(),
                handle.clone(),
                initial.clone(),
            )
            .boxed()
            .shared();
            scheduled.push(node);
        }

        let sinks: Vec<_> = self
            .sinks()
            .into_iter()
            .filter_map(|id| self.registrations.get_index_of(id))
            .map(|index| scheduled[index].clone())
            .collect();
        debug!(sinks = sinks.len(), "graph scheduled");

        let merge = self.merge.clone();
        async move {
            let outcome = try_join_all(sinks).await;
            if outcome.is_err() {
                join_all(scheduled).await;
            }
            outcome.map(|outputs| fold(&merge, initial, outputs))
        }
        .boxed()
    }

    /// Whether `id` is registered
    pub fn contains(&self, id: &str) -> bool {
        self.registrations.contains_key(id)
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Check if the graph is empty
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Registered identities in registration order
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.registrations.keys().map(String::as_str)
    }

    /// Direct dependencies of a node, in declaration order
    pub fn dependencies(&self, id: &str) -> Option<impl Iterator<Item = &str>> {
        self.registrations
            .get(id)
            .map(|r| r.dependencies.iter().map(String::as_str))
    }

    /// Nodes nothing depends on, in registration order
    pub fn sinks(&self) -> Vec<&str> {
        let consumed: HashSet<&str> = self
            .registrations
            .values()
            .flat_map(|r| r.dependencies.iter().map(String::as_str))
            .collect();

        self.identities()
            .filter(|id| !consumed.contains(id))
            .collect()
    }

    /// Group nodes by dependency depth. Nodes in the same wave never depend on
    /// each other and may run concurrently.
    pub fn waves(&self) -> Vec<Vec<&str>> {
        let mut wave_map: HashMap<&str, usize> = HashMap::new();
        let mut waves: Vec<Vec<&str>> = Vec::new();

        for (id, registration) in &self.registrations {
            let wave = registration
                .dependencies
                .iter()
                .filter_map(|d| wave_map.get(d.as_str()))
                .max()
                .map(|w| w + 1)
                .unwrap_or(0);
            wave_map.insert(id.as_str(), wave);

            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(id.as_str());
        }

        waves
    }

    /// Human-readable summary of the execution plan
    pub fn execution_plan(&self) -> String {
        let mut plan = String::new();
        for (i, wave) in self.waves().iter().enumerate() {
            plan.push_str(&format!("Wave {} ({} nodes):\n", i, wave.len()));
            for id in wave {
                let deps: Vec<&str> = self
                    .dependencies(id)
                    .map(|d| d.collect())
                    .unwrap_or_default();
                if deps.is_empty() {
                    plan.push_str(&format!("  {}\n", id));
                } else {
                    plan.push_str(&format!("  {} (after: {})\n", id, deps.join(", ")));
                }
            }
        }
        plan
    }
}

fn box_task<R, F, Fut>(task: F) -> Task<R>
where
    R: 'static,
    F: Fn(Handle, R) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    Arc::new(move |handle: Handle, input: R| -> TaskFuture<R> { task(handle, input).boxed() })
}

fn fold<R>(merge: &Merge<R>, initial: R, outputs: Vec<R>) -> R {
    match outputs.into_iter().reduce(|left, right| merge(left, right)) {
        Some(folded) => merge(initial, folded),
        None => initial,
    }
}

async fn run_node<R>(
    id: String,
    task: Task<R>,
    dependencies: Vec<Shared<TaskFuture<R>>>,
    merge: Merge<R>,
    handle: Handle,
    initial: R,
) -> Result<R>
where
    R: Clone + Send + Sync + 'static,
{
    let outputs = try_join_all(dependencies).await?;
    let input = fold(&merge, initial, outputs);

    trace!(node = %id, "dependencies resolved");
    let running = handle.spawn(task(handle.clone(), input));
    let result = running
        .await
        .unwrap_or_else(|e| Err(BuildError::Panicked {
            id: id.clone(),
            message: e.to_string(),
        }));
    if let Err(e) = &result {
        warn!(node = %id, error = %e, "node failed");
    }
    result
}
