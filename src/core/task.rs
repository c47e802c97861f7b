//! The task state machine and per-task render/build lifecycle.
//!
//! A [`Task`] owns its product, source and params, plus the three optional
//! lifecycle hooks. The DAG owns every task and injects upstream
//! information into the operations that need it; a task never reaches back
//! into the graph.
//!
//! Rendering decides what a task should do this session (run, skip, wait).
//! Building performs the work through the [`Runner`] capability and
//! finalizes the product. Status changes ripple to dependents through the
//! DAG's propagation, not through this module.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info_span};

use super::client::Client;
use super::dag::{DagError, Upstream};
use super::hook::{Hook, HookContext, TaskView};
use super::params::Params;
use super::product::{Metadata, Product, ProductError};
use super::source::{Source, SourceError};
use super::status::TaskStatus;
use super::types::TaskName;

/// Boxed error cause retained through wrapping.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Signal that user code may raise to request the whole build stop early.
///
/// A stop is not a failure: it is surfaced unmodified as
/// [`TaskError::Stop`], never wrapped into a [`BuildError`], and it does
/// not move the task into `Errored`.
#[derive(Debug, Clone, Default)]
pub struct GracefulStop {
    reason: Option<String>,
}

impl GracefulStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl fmt::Display for GracefulStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "graceful stop requested: {reason}"),
            None => write!(f, "graceful stop requested"),
        }
    }
}

/// Errors returned by user-supplied code: hooks and the run capability.
#[derive(Debug, Error)]
pub enum RunError {
    /// Execution failed with a message.
    #[error("execution failed: {0}")]
    Failed(String),

    /// Early-termination signal; never treated as a failure.
    #[error("{0}")]
    Stop(GracefulStop),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] BoxError),
}

/// Misuse of the engine's contract, caught before any work happens.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A hook declared a parameter outside the fixed set.
    #[error(
        "hook declares unknown parameter '{param}' (allowed: task, client, product, params)"
    )]
    UnknownHookParam { param: String },

    /// Externally applying a status that is not an external outcome.
    #[error("status '{status}' cannot be applied externally to task '{task}'")]
    UnsettableStatus { task: TaskName, status: TaskStatus },

    /// Building a task that was never rendered.
    #[error("task '{0}' must be rendered before building")]
    RenderFirst(TaskName),

    /// Building a task in a state that excludes execution.
    #[error("cannot build task '{task}' with status '{status}'")]
    BuildNotAllowed { task: TaskName, status: TaskStatus },

    /// Building a task whose upstream has not finished.
    #[error("cannot build task '{task}': upstream tasks have not finished")]
    UpstreamPending { task: TaskName },

    /// Rendering or building under an unrendered upstream; the caller must
    /// render the DAG first.
    #[error("upstream task '{upstream}' of '{task}' has not been rendered; render the DAG first")]
    UpstreamNotRendered { task: TaskName, upstream: TaskName },

    /// Unrecognized status-row section identifier.
    #[error("unknown status section: '{section}'")]
    UnknownSection { section: String },

    /// A snapshot was restored onto the wrong task.
    #[error("snapshot belongs to task '{found}', not '{expected}'")]
    SnapshotMismatch { expected: TaskName, found: TaskName },

    /// A snapshot payload could not be applied.
    #[error("invalid task snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Failure while rendering a task's product, source or `on_render` hook.
///
/// The task is moved into `ErroredRender` before this is returned.
#[derive(Debug, Error)]
#[error("failed to render task '{task}' (params: {params})")]
pub struct RenderError {
    pub task: TaskName,
    /// Display form of the params at failure time.
    pub params: String,
    #[source]
    pub source: BoxError,
}

/// Failure while running a task's work or finalizing its product.
///
/// The task is moved into `Errored` before this is returned, except when
/// the underlying signal is a [`GracefulStop`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// The task's work failed.
    #[error("task '{task}' failed while running")]
    Run {
        task: TaskName,
        #[source]
        source: BoxError,
    },

    /// The work succeeded but a required product does not exist.
    #[error("task '{task}' ran successfully but product '{product}' does not exist")]
    MissingArtifact { task: TaskName, product: String },

    /// The finish sequence (on_finish hook, metadata record, upload) failed.
    #[error("task '{task}' failed during the finish sequence")]
    Finish {
        task: TaskName,
        #[source]
        source: BoxError,
    },

    /// The `on_failure` hook itself failed; the original build error is
    /// chained as the cause, the hook's own failure is named here.
    #[error("on_failure hook of task '{task}' raised: {hook_error}")]
    FailureHook {
        task: TaskName,
        hook_error: String,
        #[source]
        original: Box<TaskError>,
    },
}

/// Umbrella error for every task operation.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Dag(#[from] DagError),

    /// Raw user-code failure surfaced in debugging mode
    /// (`catch_exceptions = false`): nothing wrapped, no status mutation.
    #[error(transparent)]
    Run(RunError),

    /// Early-termination signal, surfaced unmodified.
    #[error("{0}")]
    Stop(GracefulStop),
}

impl TaskError {
    /// Whether this is the graceful stop signal rather than a failure.
    pub fn is_stop(&self) -> bool {
        matches!(self, TaskError::Stop(_))
    }
}

/// Context handed to the run capability.
pub struct RunContext<'a> {
    pub params: &'a Params,
    pub product: &'a mut dyn Product,
    pub source: &'a dyn Source,
}

/// Capability supplied by a concrete task kind.
///
/// Implementations define how the work is performed; the engine owns when
/// (and whether) it runs.
pub trait Runner: Send {
    /// Build the source this task renders. Called once at task creation.
    fn init_source(&self) -> Result<Box<dyn Source>, SourceError>;

    /// Perform the task's work.
    fn run(&mut self, ctx: RunContext<'_>) -> Result<(), RunError>;

    /// Short type tag for diagnostics.
    fn kind(&self) -> &'static str {
        "task"
    }
}

/// Outcome of the lazily-evaluated staleness check, memoized per render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutdatedState {
    /// Product missing, never recorded, or older than an upstream product.
    pub data: bool,
    /// Recorded source identity differs from the current rendered source.
    pub code: bool,
}

impl OutdatedState {
    pub fn any(self) -> bool {
        self.data || self.code
    }
}

/// Result of a build call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Whether the task's work actually ran (false when it was up to date).
    pub ran: bool,
    /// Wall-clock time spent.
    pub elapsed: Duration,
}

/// Capturable task state for cross-process execution.
///
/// Carries everything a worker needs to rebuild the task's mutable state
/// and excludes the non-serializable runtime handles (runner, hooks,
/// client); the host reconstructs those on either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub name: TaskName,
    pub status: TaskStatus,
    pub params: Value,
    /// Rendered source code, if the task was rendered before capture.
    pub source_code: Option<String>,
    /// Rendered product identity, if available at capture.
    pub product_identity: Option<Value>,
    pub product_metadata: Metadata,
    pub outdated: Option<OutdatedState>,
}

/// A named unit of work producing a product from a source and params.
pub struct Task {
    name: TaskName,
    runner: Box<dyn Runner>,
    source: Box<dyn Source>,
    product: Box<dyn Product>,
    params: Params,
    client: Option<Arc<dyn Client>>,
    status: TaskStatus,
    on_render: Option<Hook>,
    on_finish: Option<Hook>,
    on_failure: Option<Hook>,
    outdated: Option<OutdatedState>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("product", &self.product)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Create a task; its source comes from the runner's
    /// [`Runner::init_source`].
    pub fn new(
        name: impl Into<TaskName>,
        runner: Box<dyn Runner>,
        product: Box<dyn Product>,
        params: Params,
    ) -> Result<Self, SourceError> {
        let source = runner.init_source()?;
        Ok(Self {
            name: name.into(),
            runner,
            source,
            product,
            params,
            client: None,
            status: TaskStatus::WaitingRender,
            on_render: None,
            on_finish: None,
            on_failure: None,
            outdated: None,
        })
    }

    pub fn with_client(mut self, client: Arc<dyn Client>) -> Self {
        self.client = Some(client);
        self
    }

    /// Attach the hook fired after a successful render.
    pub fn set_on_render(&mut self, hook: Hook) {
        self.on_render = Some(hook);
    }

    /// Attach the hook fired after a successful run, before finalization.
    pub fn set_on_finish(&mut self, hook: Hook) {
        self.on_finish = Some(hook);
    }

    /// Attach the hook fired when the task's work fails.
    pub fn set_on_failure(&mut self, hook: Hook) {
        self.on_failure = Some(hook);
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    /// The externally observable status.
    pub fn exec_status(&self) -> TaskStatus {
        self.status
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn product(&self) -> &dyn Product {
        self.product.as_ref()
    }

    pub fn source(&self) -> &dyn Source {
        self.source.as_ref()
    }

    pub fn client(&self) -> Option<&dyn Client> {
        self.client.as_deref()
    }

    /// Staleness computed by the last render, if it was evaluated.
    pub fn outdated(&self) -> Option<OutdatedState> {
        self.outdated
    }

    /// Apply an externally produced outcome. Only `Executed` and `Errored`
    /// are accepted; everything else is computed by the engine.
    pub(crate) fn set_exec_status(&mut self, status: TaskStatus) -> Result<(), ConfigError> {
        if !status.is_settable() {
            return Err(ConfigError::UnsettableStatus {
                task: self.name.clone(),
                status,
            });
        }
        debug!(task = %self.name, from = %self.status, to = %status, "exec status applied");
        self.status = status;
        Ok(())
    }

    /// Engine-internal status write, used by propagation.
    pub(crate) fn force_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    /// Drop memoized product metadata after a non-session-scoped build.
    pub(crate) fn clear_transient_metadata(&mut self) {
        self.product.clear_cached_metadata();
    }

    /// Decide what this task should do this session.
    ///
    /// Renders the product identity and the source against params, then
    /// computes the status from `force`, staleness and upstream readiness.
    /// Any failure moves the task into `ErroredRender` and is returned
    /// wrapped with the task name and params.
    pub fn render(
        &mut self,
        upstream: &Upstream,
        force: bool,
        outdated_by_code: bool,
    ) -> Result<(), TaskError> {
        let _span = info_span!("task_render", task = %self.name).entered();
        self.outdated = None;

        // upstream products go in first so product identifiers and source
        // templates can reference them
        if !upstream.is_empty() {
            self.params.set_upstream(upstream.products_value());
        }

        if let Err(e) = self.product.render(&self.params) {
            return Err(self.render_failed(Box::new(e)));
        }
        if !self.product.is_placeholder() {
            match self.product.identity() {
                Ok(identity) => self.params.set_product(identity),
                Err(e) => return Err(self.render_failed(Box::new(e))),
            }
        }
        if let Err(e) = self.source.render(&self.params) {
            return Err(self.render_failed(Box::new(e)));
        }

        let status = if !upstream.is_empty() && !upstream.all_ready() {
            TaskStatus::WaitingUpstream
        } else if force {
            // forced: the expensive staleness evaluation never runs
            TaskStatus::WaitingExecution
        } else {
            let outdated = match self.check_outdated(upstream, outdated_by_code) {
                Ok(state) => state,
                Err(e) => return Err(self.render_failed(Box::new(e))),
            };
            self.outdated = Some(outdated);
            if outdated.any() {
                TaskStatus::WaitingExecution
            } else {
                TaskStatus::Skipped
            }
        };
        self.status = status;
        debug!(task = %self.name, status = %status, "rendered");

        let hook_result = match &self.on_render {
            Some(hook) => hook.invoke(&self.hook_context()),
            None => Ok(()),
        };
        match hook_result {
            Ok(()) => Ok(()),
            Err(RunError::Stop(stop)) => Err(TaskError::Stop(stop)),
            Err(err) => Err(self.render_failed(Box::new(err))),
        }
    }

    /// Run the task's work and finalize its product. Executor entry point:
    /// assumes rendering already happened.
    pub fn build_internal(
        &mut self,
        catch_exceptions: bool,
    ) -> Result<(BuildReport, Metadata), TaskError> {
        match self.status {
            TaskStatus::WaitingRender => {
                return Err(ConfigError::RenderFirst(self.name.clone()).into());
            }
            TaskStatus::WaitingUpstream => {
                return Err(ConfigError::UpstreamPending {
                    task: self.name.clone(),
                }
                .into());
            }
            TaskStatus::Skipped | TaskStatus::Aborted | TaskStatus::AbortedRender => {
                return Err(ConfigError::BuildNotAllowed {
                    task: self.name.clone(),
                    status: self.status,
                }
                .into());
            }
            _ => {}
        }

        let _span = info_span!("task_build", task = %self.name).entered();
        let start = Instant::now();

        let run_result = self.runner.run(RunContext {
            params: &self.params,
            product: self.product.as_mut(),
            source: self.source.as_ref(),
        });

        match run_result {
            Ok(()) => {
                self.finish(catch_exceptions)?;
                self.status = TaskStatus::Executed;
                let elapsed = start.elapsed();
                debug!(task = %self.name, elapsed_ms = %elapsed.as_millis(), "executed");
                Ok((
                    BuildReport { ran: true, elapsed },
                    self.product.metadata().clone(),
                ))
            }
            Err(RunError::Stop(stop)) => {
                debug!(task = %self.name, "graceful stop requested by run");
                if catch_exceptions {
                    if let Err(hook_err) = self.invoke_on_failure() {
                        // the stop signal wins; don't lose the hook failure
                        error!(
                            task = %self.name,
                            error = %hook_err,
                            "on_failure hook failed during graceful stop"
                        );
                    }
                }
                Err(TaskError::Stop(stop))
            }
            Err(err) if !catch_exceptions => Err(TaskError::Run(err)),
            Err(err) => {
                self.status = TaskStatus::Errored;
                let original: TaskError = BuildError::Run {
                    task: self.name.clone(),
                    source: Box::new(err),
                }
                .into();
                match self.invoke_on_failure() {
                    Ok(()) => Err(original),
                    Err(RunError::Stop(stop)) => {
                        error!(
                            task = %self.name,
                            error = %original,
                            "build error superseded by graceful stop from on_failure"
                        );
                        Err(TaskError::Stop(stop))
                    }
                    Err(hook_err) => Err(BuildError::FailureHook {
                        task: self.name.clone(),
                        hook_error: hook_err.to_string(),
                        original: Box::new(original),
                    }
                    .into()),
                }
            }
        }
    }

    /// Finish sequence: on_finish hook, record the new source identity,
    /// verify every owned product exists, upload.
    fn finish(&mut self, catch_exceptions: bool) -> Result<(), TaskError> {
        let hook_result = match &self.on_finish {
            Some(hook) => hook.invoke(&self.hook_context()),
            None => Ok(()),
        };
        match hook_result {
            Ok(()) => {}
            Err(RunError::Stop(stop)) => return Err(TaskError::Stop(stop)),
            Err(err) if !catch_exceptions => return Err(TaskError::Run(err)),
            Err(err) => {
                self.status = TaskStatus::Errored;
                return Err(BuildError::Finish {
                    task: self.name.clone(),
                    source: Box::new(err),
                }
                .into());
            }
        }

        let code = match self.source.code() {
            Ok(code) => code.to_string(),
            Err(e) => return Err(self.finish_failed(Box::new(e))),
        };
        if let Err(e) = self.product.update_metadata(&code) {
            return Err(self.finish_failed(Box::new(e)));
        }

        match self.product.exists() {
            Ok(true) => {}
            Ok(false) => {
                self.status = TaskStatus::Errored;
                let product = self
                    .product
                    .identity()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| "<unrendered>".to_string());
                return Err(BuildError::MissingArtifact {
                    task: self.name.clone(),
                    product,
                }
                .into());
            }
            Err(e) => return Err(self.finish_failed(Box::new(e))),
        }

        if let Err(e) = self.product.upload() {
            return Err(self.finish_failed(Box::new(e)));
        }
        Ok(())
    }

    /// Diagnostic snapshot over the recognized section identifiers.
    pub fn status_row(&self, sections: &[&str]) -> Result<Vec<(String, Value)>, ConfigError> {
        let mut row = Vec::with_capacity(sections.len());
        for &section in sections {
            let value = match section {
                "name" => json!(self.name.as_str()),
                "type" => json!(self.runner.kind()),
                "status" => json!(self.status.as_str()),
                "client" => self
                    .client
                    .as_ref()
                    .map(|c| json!(c.name()))
                    .unwrap_or(Value::Null),
                "last_run" => self
                    .product
                    .metadata()
                    .timestamp
                    .map(|t| json!(t.to_rfc3339()))
                    .unwrap_or(Value::Null),
                "outdated" => self.outdated.map(|o| json!(o.any())).unwrap_or(Value::Null),
                "outdated_dependencies" => {
                    self.outdated.map(|o| json!(o.data)).unwrap_or(Value::Null)
                }
                "outdated_code" => self.outdated.map(|o| json!(o.code)).unwrap_or(Value::Null),
                "product_type" => json!(self.product.kind()),
                "product" => self.product.identity().unwrap_or(Value::Null),
                "product_client" => self
                    .product
                    .client()
                    .map(|c| json!(c.name()))
                    .unwrap_or(Value::Null),
                "doc" => self.source.doc().map(|d| json!(d)).unwrap_or(Value::Null),
                "location" => self.source.loc().map(|l| json!(l)).unwrap_or(Value::Null),
                other => {
                    return Err(ConfigError::UnknownSection {
                        section: other.to_string(),
                    });
                }
            };
            row.push((section.to_string(), value));
        }
        Ok(row)
    }

    /// Capture the mutable state for transfer to a worker process.
    pub fn capture(&self) -> TaskSnapshot {
        TaskSnapshot {
            name: self.name.clone(),
            status: self.status,
            params: self.params.to_value(),
            source_code: self.source.code().ok().map(str::to_string),
            product_identity: self.product.identity().ok(),
            product_metadata: self.product.metadata().clone(),
            outdated: self.outdated,
        }
    }

    /// Restore state captured in another process onto this task.
    ///
    /// Runtime handles (runner, hooks, client) are untouched: they were
    /// never captured and stay as constructed on this side.
    pub fn restore(&mut self, snapshot: TaskSnapshot) -> Result<(), ConfigError> {
        if snapshot.name != self.name {
            return Err(ConfigError::SnapshotMismatch {
                expected: self.name.clone(),
                found: snapshot.name,
            });
        }
        self.params
            .restore(snapshot.params)
            .map_err(|e| ConfigError::InvalidSnapshot(e.to_string()))?;
        if let Some(code) = snapshot.source_code {
            self.source.restore_rendered(code);
        }
        if let Some(identity) = &snapshot.product_identity {
            self.product
                .restore_identity(identity)
                .map_err(|e| ConfigError::InvalidSnapshot(e.to_string()))?;
        }
        *self.product.metadata_mut() = snapshot.product_metadata;
        self.status = snapshot.status;
        self.outdated = snapshot.outdated;
        Ok(())
    }

    fn hook_context(&self) -> HookContext<'_> {
        HookContext {
            task: TaskView {
                name: &self.name,
                status: self.status,
            },
            client: self.client.as_deref(),
            product: Some(self.product.as_ref()),
            params: Some(&self.params),
        }
    }

    fn invoke_on_failure(&self) -> Result<(), RunError> {
        match &self.on_failure {
            Some(hook) => hook.invoke(&self.hook_context()),
            None => Ok(()),
        }
    }

    fn render_failed(&mut self, source: BoxError) -> TaskError {
        self.status = TaskStatus::ErroredRender;
        RenderError {
            task: self.name.clone(),
            params: self.params.to_string(),
            source,
        }
        .into()
    }

    fn finish_failed(&mut self, source: BoxError) -> TaskError {
        self.status = TaskStatus::Errored;
        BuildError::Finish {
            task: self.name.clone(),
            source,
        }
        .into()
    }

    fn check_outdated(
        &self,
        upstream: &Upstream,
        outdated_by_code: bool,
    ) -> Result<OutdatedState, ProductError> {
        if !self.product.exists()? {
            return Ok(OutdatedState {
                data: true,
                code: false,
            });
        }
        let meta = self.product.metadata();
        let data = match meta.timestamp {
            None => true,
            Some(own) => upstream.iter().any(|entry| match entry.timestamp {
                Some(up) => up > own,
                // upstream product never recorded a build: assume newer
                None => true,
            }),
        };
        let code = outdated_by_code && meta.stored_source_code.as_deref() != self.source.code().ok();
        Ok(OutdatedState { data, code })
    }
}
