//! The DAG: exclusive owner of tasks and dependency edges.
//!
//! Tasks never reference the graph; the graph drives them. Every
//! operation that changes a task's externally observable status goes
//! through the DAG so the change can ripple to direct dependents as a
//! wavefront of single-hop status updates.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info_span};

use super::product::Metadata;
use super::status::TaskStatus;
use super::task::{BuildReport, ConfigError, Task, TaskError};
use super::types::TaskName;

/// Errors that can occur when assembling or sweeping a DAG.
#[derive(Debug, Error)]
pub enum DagError {
    /// Attempted to add a task under a name that is already taken.
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskName),

    /// Task not found in the DAG.
    #[error("task not found: {0}")]
    TaskNotFound(TaskName),

    /// An edge references a task that doesn't exist.
    #[error("missing edge endpoint: '{parent}' -> '{child}'")]
    MissingEdgeEndpoint { parent: TaskName, child: TaskName },

    /// The edge would make the graph cyclic; nothing was added.
    #[error("cycle detected: edge '{parent}' -> '{child}' would close a loop")]
    CycleDetected { parent: TaskName, child: TaskName },

    /// One or more tasks failed during a render sweep.
    #[error("{} task(s) failed to render", .failures.len())]
    RenderSweep {
        failures: Vec<(TaskName, TaskError)>,
    },
}

/// Snapshot of one direct upstream task, taken just before a render.
#[derive(Debug, Clone)]
pub struct UpstreamEntry {
    pub name: TaskName,
    pub status: TaskStatus,
    /// The upstream task's rendered product identity (Null if unrendered).
    pub product: Value,
    /// When the upstream product was last produced.
    pub timestamp: Option<DateTime<Utc>>,
}

impl UpstreamEntry {
    pub fn new(
        name: impl Into<TaskName>,
        status: TaskStatus,
        product: Value,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            product,
            timestamp,
        }
    }
}

/// The direct upstream view a task renders against.
#[derive(Debug, Clone, Default)]
pub struct Upstream {
    entries: Vec<UpstreamEntry>,
}

impl Upstream {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<UpstreamEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every upstream task counts as done.
    pub fn all_ready(&self) -> bool {
        self.entries.iter().all(|e| e.status.is_ready())
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpstreamEntry> {
        self.entries.iter()
    }

    /// The mapping injected into params under `upstream`.
    pub fn products_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|e| (e.name.to_string(), e.product.clone()))
                .collect(),
        )
    }
}

/// An ordered set of task names, for wiring several parents at once.
#[derive(Debug, Clone, Default)]
pub struct TaskGroup {
    names: Vec<TaskName>,
}

impl TaskGroup {
    pub fn new<I, T>(names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskName>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> &[TaskName] {
        &self.names
    }

    pub fn push(&mut self, name: impl Into<TaskName>) {
        self.names.push(name.into());
    }
}

/// A directed acyclic graph of tasks, keyed by name.
///
/// Insertion order is irrelevant to correctness but kept stable for
/// diagnostics.
pub struct Dag {
    name: String,
    tasks: HashMap<TaskName, Task>,
    /// Insertion order of task names.
    order: Vec<TaskName>,
    /// child -> the tasks it depends on.
    dependencies: HashMap<TaskName, Vec<TaskName>>,
}

impl Dag {
    /// Create a new empty DAG.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: HashMap::new(),
            order: Vec::new(),
            dependencies: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Task names in insertion order.
    pub fn task_names(&self) -> &[TaskName] {
        &self.order
    }

    /// Register a task. Its name must be unused.
    pub fn add_task(&mut self, task: Task) -> Result<(), DagError> {
        let name = task.name().clone();
        if self.tasks.contains_key(&name) {
            return Err(DagError::DuplicateTask(name));
        }
        self.dependencies.insert(name.clone(), Vec::new());
        self.order.push(name.clone());
        self.tasks.insert(name, task);
        Ok(())
    }

    /// Add a dependency edge: `child` depends on `parent`.
    ///
    /// Rejects edges to missing tasks and edges that would close a cycle;
    /// on error the graph is unchanged.
    pub fn add_edge(&mut self, parent: &TaskName, child: &TaskName) -> Result<(), DagError> {
        if !self.tasks.contains_key(parent) || !self.tasks.contains_key(child) {
            return Err(DagError::MissingEdgeEndpoint {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        if parent == child || self.depends_on(parent, child) {
            return Err(DagError::CycleDetected {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        let deps = self.dependencies.entry(child.clone()).or_default();
        if !deps.contains(parent) {
            deps.push(parent.clone());
        }
        Ok(())
    }

    /// Wire several parents onto one child.
    pub fn set_upstream(&mut self, child: &TaskName, parents: &TaskGroup) -> Result<(), DagError> {
        for parent in parents.names() {
            self.add_edge(parent, child)?;
        }
        Ok(())
    }

    /// Whether `task` (transitively) depends on `other`.
    fn depends_on(&self, task: &TaskName, other: &TaskName) -> bool {
        let mut stack: Vec<&TaskName> = match self.dependencies.get(task) {
            Some(deps) => deps.iter().collect(),
            None => return false,
        };
        let mut seen: Vec<&TaskName> = Vec::new();
        while let Some(current) = stack.pop() {
            if current == other {
                return true;
            }
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            if let Some(deps) = self.dependencies.get(current) {
                stack.extend(deps.iter());
            }
        }
        false
    }

    pub fn task(&self, name: &TaskName) -> Result<&Task, DagError> {
        self.tasks
            .get(name)
            .ok_or_else(|| DagError::TaskNotFound(name.clone()))
    }

    /// Mutable access, e.g. for attaching hooks after registration.
    ///
    /// Lifecycle operations should go through the DAG entry points so
    /// status changes propagate.
    pub fn task_mut(&mut self, name: &TaskName) -> Result<&mut Task, DagError> {
        self.tasks
            .get_mut(name)
            .ok_or_else(|| DagError::TaskNotFound(name.clone()))
    }

    /// Direct upstream tasks of `name`, keyed by their names.
    pub fn get_upstream(&self, name: &TaskName) -> Result<BTreeMap<&TaskName, &Task>, DagError> {
        if !self.tasks.contains_key(name) {
            return Err(DagError::TaskNotFound(name.clone()));
        }
        let mut upstream = BTreeMap::new();
        if let Some(deps) = self.dependencies.get(name) {
            for parent in deps {
                if let Some(task) = self.tasks.get(parent) {
                    upstream.insert(parent, task);
                }
            }
        }
        Ok(upstream)
    }

    /// Tasks that directly depend on `name`.
    pub fn get_downstream(&self, name: &TaskName) -> Vec<&TaskName> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.contains(name))
            .map(|(child, _)| child)
            .collect()
    }

    /// Tasks in dependency order (Kahn's algorithm).
    pub fn topological_sort(&self) -> Result<Vec<TaskName>, DagError> {
        let mut in_degree: HashMap<&TaskName, usize> = HashMap::new();
        for name in &self.order {
            let degree = self.dependencies.get(name).map(|d| d.len()).unwrap_or(0);
            in_degree.insert(name, degree);
        }

        // seed with independent tasks, in insertion order for stability
        let mut queue: VecDeque<&TaskName> = self
            .order
            .iter()
            .filter(|name| in_degree.get(*name) == Some(&0))
            .collect();

        let mut result = Vec::with_capacity(self.order.len());
        while let Some(name) = queue.pop_front() {
            result.push(name.clone());
            for child in self.get_downstream(name) {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if result.len() != self.order.len() {
            // cannot happen while add_edge rejects cycles, but keep the
            // invariant checked rather than assumed
            let stuck = in_degree
                .iter()
                .find(|(_, degree)| **degree > 0)
                .map(|(name, _)| (*name).clone());
            if let Some(name) = stuck {
                return Err(DagError::CycleDetected {
                    parent: name.clone(),
                    child: name,
                });
            }
        }
        Ok(result)
    }

    /// Render a single task.
    ///
    /// Validates that every upstream task has been rendered (orchestration
    /// order is the caller's job; this only rejects violations), snapshots
    /// the upstream, renders, then re-applies the single-hop upstream rule
    /// to the task itself and propagates to its dependents.
    pub fn render(
        &mut self,
        name: &TaskName,
        force: bool,
        outdated_by_code: bool,
    ) -> Result<(), TaskError> {
        let upstream = self.upstream_snapshot(name)?;
        for entry in upstream.iter() {
            if entry.status == TaskStatus::WaitingRender {
                return Err(ConfigError::UpstreamNotRendered {
                    task: name.clone(),
                    upstream: entry.name.clone(),
                }
                .into());
            }
        }

        let task = self
            .tasks
            .get_mut(name)
            .ok_or_else(|| DagError::TaskNotFound(name.clone()))?;
        let result = task.render(&upstream, force, outdated_by_code);

        // a task rendered under an already-failed upstream is aborted via
        // the same single-hop rule propagation uses
        self.refresh_from_upstream(name);
        self.propagate_from(name);
        result
    }

    /// Render every task in topological order.
    ///
    /// Render failures do not stop the sweep: the failing task ends in
    /// `ErroredRender`, its dependents are driven to `AbortedRender`
    /// through propagation, and all failures are reported together. A
    /// graceful stop raised by an `on_render` hook halts immediately.
    pub fn render_all(&mut self, force: bool, outdated_by_code: bool) -> Result<(), TaskError> {
        let _span = info_span!("dag_render", dag = %self.name).entered();
        let order = self.topological_sort()?;
        let mut failures = Vec::new();
        for name in order {
            match self.render(&name, force, outdated_by_code) {
                Ok(()) => {}
                Err(TaskError::Stop(stop)) => return Err(TaskError::Stop(stop)),
                Err(err) => failures.push((name, err)),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DagError::RenderSweep { failures }.into())
        }
    }

    /// Public single-task build entry point: render, then run and finalize.
    ///
    /// An up-to-date task reports `ran: false` without invoking its
    /// runner. Building a task whose upstream has not finished is a
    /// configuration error.
    pub fn build(
        &mut self,
        name: &TaskName,
        force: bool,
        catch_exceptions: bool,
    ) -> Result<(BuildReport, Metadata), TaskError> {
        let _span = info_span!("dag_build", dag = %self.name, task = %name).entered();
        self.render(name, force, true)?;

        let status = self.task(name)?.exec_status();
        if status == TaskStatus::WaitingUpstream {
            return Err(ConfigError::UpstreamPending { task: name.clone() }.into());
        }
        if status == TaskStatus::Skipped {
            debug!(task = %name, "up to date, nothing to build");
            let metadata = self.task(name)?.product().metadata().clone();
            return Ok((
                BuildReport {
                    ran: false,
                    elapsed: std::time::Duration::ZERO,
                },
                metadata,
            ));
        }

        let task = self
            .tasks
            .get_mut(name)
            .ok_or_else(|| DagError::TaskNotFound(name.clone()))?;
        let result = task.build_internal(catch_exceptions);
        // this path is not session-scoped: drop memoized product metadata
        task.clear_transient_metadata();
        self.propagate_from(name);
        result
    }

    /// Executor entry point: build a task that was already rendered.
    pub fn build_internal(
        &mut self,
        name: &TaskName,
        catch_exceptions: bool,
    ) -> Result<(BuildReport, Metadata), TaskError> {
        let task = self
            .tasks
            .get_mut(name)
            .ok_or_else(|| DagError::TaskNotFound(name.clone()))?;
        let result = task.build_internal(catch_exceptions);
        self.propagate_from(name);
        result
    }

    /// Apply an externally produced outcome (`Executed` or `Errored`),
    /// e.g. reported back by a worker process, and propagate.
    pub fn set_exec_status(&mut self, name: &TaskName, status: TaskStatus) -> Result<(), TaskError> {
        let task = self
            .tasks
            .get_mut(name)
            .ok_or_else(|| DagError::TaskNotFound(name.clone()))?;
        task.set_exec_status(status)?;
        self.propagate_from(name);
        Ok(())
    }

    /// Diagnostic rows for every task, in insertion order.
    pub fn status_table(&self, sections: &[&str]) -> Result<Vec<Vec<(String, Value)>>, TaskError> {
        let mut table = Vec::with_capacity(self.order.len());
        for name in &self.order {
            let task = self.task(name)?;
            table.push(task.status_row(sections)?);
        }
        Ok(table)
    }

    fn upstream_snapshot(&self, name: &TaskName) -> Result<Upstream, DagError> {
        if !self.tasks.contains_key(name) {
            return Err(DagError::TaskNotFound(name.clone()));
        }
        let mut entries = Vec::new();
        if let Some(deps) = self.dependencies.get(name) {
            for parent in deps {
                if let Some(task) = self.tasks.get(parent) {
                    entries.push(UpstreamEntry {
                        name: parent.clone(),
                        status: task.exec_status(),
                        product: task.product().identity().unwrap_or(Value::Null),
                        timestamp: task.product().metadata().timestamp,
                    });
                }
            }
        }
        Ok(Upstream::from_entries(entries))
    }

    /// Re-apply the single-hop upstream rule to `name` itself.
    fn refresh_from_upstream(&mut self, name: &TaskName) {
        let statuses = self.parent_statuses(name);
        if statuses.is_empty() {
            return;
        }
        let Some(task) = self.tasks.get(name) else {
            return;
        };
        let current = task.exec_status();
        if let Some(new) = next_status_from_upstream(current, &statuses) {
            if new != current {
                if let Some(task) = self.tasks.get_mut(name) {
                    task.force_status(new);
                }
                debug!(task = %name, from = %current, to = %new, "status recomputed from upstream");
            }
        }
    }

    /// Wavefront propagation: starting from a task whose status changed,
    /// recompute direct dependents hop by hop until nothing changes.
    ///
    /// Idempotent by construction: a dependent is only re-enqueued when
    /// its status actually changed, so re-running on a consistent graph is
    /// a no-op and the fixed point is reached in at most |V| hops.
    fn propagate_from(&mut self, name: &TaskName) {
        let mut queue: VecDeque<TaskName> = VecDeque::new();
        queue.push_back(name.clone());

        while let Some(current) = queue.pop_front() {
            let dependents: Vec<TaskName> = self
                .get_downstream(&current)
                .into_iter()
                .cloned()
                .collect();
            for dependent in dependents {
                let statuses = self.parent_statuses(&dependent);
                let Some(task) = self.tasks.get(&dependent) else {
                    continue;
                };
                let status = task.exec_status();
                let Some(new) = next_status_from_upstream(status, &statuses) else {
                    continue;
                };
                if new == status {
                    continue;
                }
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    task.force_status(new);
                }
                debug!(task = %dependent, from = %status, to = %new, "status propagated");
                queue.push_back(dependent);
            }
        }
    }

    fn parent_statuses(&self, name: &TaskName) -> Vec<TaskStatus> {
        self.dependencies
            .get(name)
            .map(|deps| {
                deps.iter()
                    .filter_map(|p| self.tasks.get(p))
                    .map(|t| t.exec_status())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Dag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dag")
            .field("name", &self.name)
            .field("tasks", &self.order)
            .finish_non_exhaustive()
    }
}

/// The single-hop status rule shared by propagation and post-render
/// refresh. Returns `None` when the task's current state is not driven by
/// its upstream.
fn next_status_from_upstream(current: TaskStatus, upstream: &[TaskStatus]) -> Option<TaskStatus> {
    if !matches!(
        current,
        TaskStatus::WaitingUpstream | TaskStatus::WaitingExecution
    ) {
        return None;
    }
    if upstream.is_empty() {
        return None;
    }
    if upstream.iter().any(|s| s.is_failure()) {
        Some(TaskStatus::Aborted)
    } else if upstream.iter().any(|s| s.is_render_failure()) {
        Some(TaskStatus::AbortedRender)
    } else if upstream.iter().all(|s| s.is_ready()) {
        match current {
            TaskStatus::WaitingUpstream => Some(TaskStatus::WaitingExecution),
            _ => None,
        }
    } else {
        None
    }
}
