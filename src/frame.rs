//! The per-frame loop around a [`TaskQueue`].
//!
//! Subsystems (animation, skinning, rendering, ...) implement [`System`] and
//! are registered once in a [`FrameDriver`]. Every frame the driver asks each
//! of them, in registration order, to contribute tasks, then runs the queue
//! to completion and flushes it.
//!
//! Systems only ever see a [`Registrar`], a narrow view of the queue that can
//! add tasks and dependencies but can't start, wait on or flush the frame.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::ThreadPool;

use crate::config::SchedulerConfig;
use crate::error::QueueError;
use crate::queue::TaskQueue;
use crate::runner::Diagnostics;
use crate::task::{IntoTaskResult, Task, TaskId};

/// Per-frame timing handed to every [`System`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameInfo {
    /// Sequential frame number, starting at zero.
    pub index: u64,
    /// Time since the previous frame.
    pub delta: Duration,
    /// Time since the first frame.
    pub elapsed: Duration,
}

impl FrameInfo {
    pub fn new(index: u64, delta: Duration) -> Self {
        Self {
            index,
            delta,
            elapsed: Duration::ZERO,
        }
    }

    /// Delta time in seconds, as most simulation code wants it.
    pub fn delta_secs(&self) -> f32 {
        self.delta.as_secs_f32()
    }
}

/// A producer of per-frame tasks.
///
/// Systems don't know about each other. When one of them needs to run after
/// work owned by another, it depends on that work by name with
/// [`Registrar::add_pending_dependency`].
pub trait System: Send {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    fn generate_tasks(
        &mut self,
        registrar: &mut Registrar<'_>,
        frame: &FrameInfo,
    ) -> anyhow::Result<()>;
}

/// The part of a [`TaskQueue`] a [`System`] is allowed to touch.
pub struct Registrar<'q> {
    queue: &'q mut TaskQueue,
}

impl<'q> Registrar<'q> {
    pub fn new(queue: &'q mut TaskQueue) -> Self {
        Self { queue }
    }

    pub fn register_task<T>(&mut self, task: T) -> Result<TaskId, QueueError>
    where
        T: Task + 'static,
    {
        self.queue.register_task(task)
    }

    pub fn register_fn<F, R>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        func: F,
    ) -> Result<TaskId, QueueError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoTaskResult + 'static,
    {
        self.queue.register_fn(name, func)
    }

    pub fn add_dependency(&mut self, before: TaskId, after: TaskId) -> Result<(), QueueError> {
        self.queue.add_dependency(before, after)
    }

    pub fn add_pending_dependency(
        &mut self,
        before: impl AsRef<str>,
        after: TaskId,
    ) -> Result<(), QueueError> {
        self.queue.add_pending_dependency(before, after)
    }

    /// See [`TaskQueue::compute_pool`].
    pub fn compute_pool(&self) -> Arc<ThreadPool> {
        self.queue.compute_pool()
    }

    /// Every task registered under `name` so far this frame.
    pub fn find(&self, name: &str) -> Vec<TaskId> {
        self.queue.find(name)
    }
}

/// Owns the queue and the systems, and runs frames one after the other.
pub struct FrameDriver {
    queue: TaskQueue,
    systems: Vec<Box<dyn System>>,
    frames: u64,
    first: Option<Instant>,
    last: Option<Instant>,
}

impl FrameDriver {
    pub fn new(queue: TaskQueue) -> Self {
        Self {
            queue,
            systems: Vec::new(),
            frames: 0,
            first: None,
            last: None,
        }
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self, QueueError> {
        Ok(Self::new(TaskQueue::with_config(config)?))
    }

    pub fn add_system(&mut self, system: impl System + 'static) -> &mut Self {
        self.systems.push(Box::new(system));
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn systems(&self) -> usize {
        self.systems.len()
    }

    /// Number of frames run so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Run one frame, measuring the delta time since the previous one.
    pub fn run_frame(&mut self) -> Result<Diagnostics, QueueError> {
        let now = Instant::now();
        let first = *self.first.get_or_insert(now);
        let delta = self.last.map(|last| now - last).unwrap_or_default();
        self.last = Some(now);

        let info = FrameInfo {
            index: self.frames,
            delta,
            elapsed: now - first,
        };

        self.run_frame_with(info)
    }

    /// Run one frame with caller-provided timing.
    ///
    /// The queue is flushed before returning, whatever the outcome, so the
    /// next frame always starts from an empty graph.
    pub fn run_frame_with(&mut self, info: FrameInfo) -> Result<Diagnostics, QueueError> {
        let span = tracing::info_span!("frame", index = info.index);
        let _enter = span.enter();

        let result = self.execute(&info);
        self.queue.flush();
        self.frames += 1;

        match &result {
            Ok(diagnostics) if !diagnostics.is_success() => {
                tracing::error!(
                    "frame {} finished with {} failed tasks",
                    info.index,
                    diagnostics.failures.len()
                );
            }
            Ok(_) => {}
            Err(err) => tracing::error!("frame {} aborted: {err}", info.index),
        }

        result
    }

    fn execute(&mut self, info: &FrameInfo) -> Result<Diagnostics, QueueError> {
        for system in &mut self.systems {
            let mut registrar = Registrar::new(&mut self.queue);
            system
                .generate_tasks(&mut registrar, info)
                .map_err(|error| QueueError::System {
                    system: system.name().into_owned(),
                    error,
                })?;
        }

        self.queue.start_tasks()?;
        self.queue.wait_for_tasks()
    }
}

impl std::fmt::Debug for FrameDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.systems.iter().map(|s| s.name()).collect();
        f.debug_struct("FrameDriver")
            .field("queue", &self.queue)
            .field("systems", &names)
            .field("frames", &self.frames)
            .finish()
    }
}
