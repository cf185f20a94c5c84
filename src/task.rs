//! The unit of per-frame work.
//!
//! A [`Task`] is anything with a name that can be processed once. Most
//! systems don't implement the trait themselves, they wrap a closure in a
//! [`FunctionTask`] (or call [`crate::TaskQueue::register_fn`], which does
//! the same thing).
//!
//! Once registered, a task is owned by the queue and referred to through a
//! [`TaskId`]. The id is only meaningful for the frame it was issued in:
//! after a flush the queue rejects it.

use std::borrow::Cow;

use petgraph::graph::NodeIndex;

/// Result from a single executed task.
pub type TaskResult = anyhow::Result<()>;

/// A unit of work scheduled by the [`crate::TaskQueue`].
///
/// The queue calls [`Task::process`] exactly once per frame, from one of its
/// worker threads. Errors and panics raised here are caught by the worker and
/// recorded as failures of the frame.
pub trait Task: Send {
    /// Name used for diagnostics and for name-based dependency resolution.
    fn name(&self) -> &str;

    /// Run the work.
    fn process(&mut self) -> TaskResult;
}

impl Task for Box<dyn Task> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn process(&mut self) -> TaskResult {
        (**self).process()
    }
}

/// Return types accepted from a [`FunctionTask`] body.
pub trait IntoTaskResult {
    fn into_task_result(self) -> TaskResult;
}

impl IntoTaskResult for () {
    fn into_task_result(self) -> TaskResult {
        Ok(())
    }
}

impl<E> IntoTaskResult for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_task_result(self) -> TaskResult {
        self.map_err(Into::into)
    }
}

/// Wraps a callable and a display name.
///
/// Construction does no work; the callable runs on the first call to
/// [`Task::process`]. A second call returns an error instead of running the
/// body again.
pub struct FunctionTask<F> {
    name: Cow<'static, str>,
    func: Option<F>,
}

impl<F, R> FunctionTask<F>
where
    F: FnOnce() -> R + Send,
    R: IntoTaskResult,
{
    pub fn new(name: impl Into<Cow<'static, str>>, func: F) -> Self {
        Self {
            name: name.into(),
            func: Some(func),
        }
    }

    /// Whether the body has already been consumed.
    pub fn is_processed(&self) -> bool {
        self.func.is_none()
    }
}

impl<F, R> Task for FunctionTask<F>
where
    F: FnOnce() -> R + Send,
    R: IntoTaskResult,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self) -> TaskResult {
        match self.func.take() {
            Some(func) => func().into_task_result(),
            None => Err(anyhow::anyhow!("task '{}' was already processed", self.name)),
        }
    }
}

impl<F> std::fmt::Debug for FunctionTask<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FunctionTask({})", self.name)
    }
}

/// Opaque handle of a task registered in a [`crate::TaskQueue`].
///
/// A `TaskId` is a lightweight, copyable token. It pairs the slot of the task
/// in the queue's arena with the frame generation it was issued in, so ids
/// kept around past a flush are detected instead of silently pointing at an
/// unrelated task of the next frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub(crate) frame: u64,
    pub(crate) index: NodeIndex,
}

impl TaskId {
    pub(crate) fn new(index: NodeIndex, frame: u64) -> Self {
        Self { frame, index }
    }

    /// Position of the task in registration order within its frame.
    pub fn index(&self) -> usize {
        self.index.index()
    }

    /// Frame generation this id belongs to.
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

impl std::fmt::Debug for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskId({}@{})", self.index.index(), self.frame)
    }
}
