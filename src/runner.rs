mod diagnostics;
mod workers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::NodeIndex;

use crate::error::QueueError;
use crate::graph::{ArcStr, TaskGraph};
use crate::task::{Task, TaskId};
use crate::utils::{lock, panic_message};

pub use diagnostics::{Diagnostics, TaskFailure};
pub(crate) use workers::{Spawner, WorkerPool};

/// Scheduling state of a single task within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Registered, some dependencies are not done yet.
    Waiting,
    /// All dependencies are done, queued for a free worker.
    Ready,
    /// Currently executing on a worker.
    Running,
    /// Finished, successfully or not.
    Done,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
    /// Index of the scheduler worker that ran the task.
    pub worker: Option<usize>,
}

/// Message a worker sends back once a task is done.
struct Completion {
    index: usize,
    execution: TaskExecution,
    error: Option<String>,
}

/// Counters mutated by workers as tasks complete.
struct Progress {
    remaining: Vec<usize>,
    states: Vec<TaskState>,
}

/// Everything a worker needs, shared read-only apart from `progress` and the
/// concurrency counters.
struct Shared {
    frame: u64,
    spawner: Spawner,
    names: Vec<ArcStr>,
    dependents: Vec<Vec<usize>>,
    tasks: Vec<Mutex<Box<dyn Task>>>,
    progress: Mutex<Progress>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Shared {
    fn set_state(&self, index: usize, state: TaskState) {
        lock(&self.progress).states[index] = state;
    }

    /// Mark `index` as done and return the dependents that became ready.
    fn complete(&self, index: usize) -> Vec<usize> {
        let mut progress = lock(&self.progress);
        progress.states[index] = TaskState::Done;

        let mut ready = Vec::new();
        for &next in &self.dependents[index] {
            progress.remaining[next] -= 1;
            if progress.remaining[next] == 0 {
                progress.states[next] = TaskState::Ready;
                ready.push(next);
            }
        }
        ready
    }
}

/// One frame in flight.
///
/// The graph is frozen when the run starts: topology and names are copied
/// into [`Shared`], the task bodies are moved there, one mutex per task.
/// Workers finishing a task update the dependency counts themselves and
/// immediately dispatch whatever became ready, then report back over a
/// channel. The thread waiting on the frame only drains that channel.
pub(crate) struct Run {
    shared: Arc<Shared>,
    receiver: Receiver<Completion>,
    total: usize,
    completed: usize,
    started: Instant,
    execution_times: HashMap<TaskId, TaskExecution>,
    failures: Vec<TaskFailure>,
}

impl Run {
    /// Freeze the graph and dispatch every task without dependencies.
    ///
    /// The caller guarantees the graph is acyclic and that `tasks` is indexed
    /// like the graph nodes.
    pub(crate) fn start(
        spawner: Spawner,
        frame: u64,
        graph: &TaskGraph,
        tasks: Vec<Box<dyn Task>>,
    ) -> Self {
        // Build a map from a dependency to the tasks that depend on it.
        let mut dependents = vec![Vec::new(); graph.node_count()];
        for edge in graph.raw_edges() {
            dependents[edge.source().index()].push(edge.target().index());
        }

        let remaining: Vec<usize> = graph
            .node_indices()
            .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();

        let states = remaining
            .iter()
            .map(|&count| match count {
                0 => TaskState::Ready,
                _ => TaskState::Waiting,
            })
            .collect();

        let seeds: Vec<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| i)
            .collect();

        let shared = Arc::new(Shared {
            frame,
            spawner,
            names: graph.node_weights().map(|node| node.name.clone()).collect(),
            dependents,
            tasks: tasks.into_iter().map(Mutex::new).collect(),
            progress: Mutex::new(Progress { remaining, states }),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let (sender, receiver) = channel();
        let started = Instant::now();

        tracing::debug!(
            "frame {frame}: dispatching {} of {} tasks",
            seeds.len(),
            graph.node_count()
        );

        // Seed initial tasks
        for index in seeds {
            dispatch(&shared, &sender, index);
        }

        Self {
            total: shared.names.len(),
            shared,
            receiver,
            completed: 0,
            started,
            execution_times: HashMap::new(),
            failures: Vec::new(),
        }
    }

    pub(crate) fn state(&self, index: usize) -> TaskState {
        lock(&self.shared.progress).states[index]
    }

    /// Block until every task of the frame has reported back.
    pub(crate) fn wait(&mut self) -> Result<(), QueueError> {
        while self.completed < self.total {
            // Workers own the only senders; if they are all gone before the
            // count is reached, nothing will ever arrive.
            let completion = self.receiver.recv().map_err(|_| QueueError::WorkersLost)?;

            let id = TaskId::new(NodeIndex::new(completion.index), self.shared.frame);
            self.execution_times.insert(id, completion.execution);

            if let Some(message) = completion.error {
                self.failures.push(TaskFailure {
                    id,
                    name: self.shared.names[completion.index].to_string(),
                    message,
                });
            }

            self.completed += 1;
        }

        Ok(())
    }

    /// Summarise a drained frame.
    pub(crate) fn into_diagnostics(self, graph: &TaskGraph, workers: usize) -> Diagnostics {
        let frame = self.shared.frame;
        let edges = graph
            .raw_edges()
            .iter()
            .map(|edge| {
                (
                    TaskId::new(edge.source(), frame),
                    TaskId::new(edge.target(), frame),
                )
            })
            .collect();

        Diagnostics {
            frame,
            workers,
            names: self.shared.names.iter().map(|n| n.to_string()).collect(),
            edges,
            execution_times: self.execution_times,
            failures: self.failures,
            peak_concurrency: self.shared.peak.load(Ordering::SeqCst),
            wall_time: self.started.elapsed(),
        }
    }
}

fn dispatch(shared: &Arc<Shared>, sender: &Sender<Completion>, index: usize) {
    let shared_clone = Arc::clone(shared);
    let sender = sender.clone();
    shared
        .spawner
        .spawn(move || execute(shared_clone, sender, index));
}

/// Worker side: run one task, unlock its dependents, report back.
fn execute(shared: Arc<Shared>, sender: Sender<Completion>, index: usize) {
    let name = &shared.names[index];
    let span = tracing::info_span!("task", name = %name, frame = shared.frame);
    let _enter = span.enter();

    // A panicking task must not take the worker down with it, and the mutex
    // guard is dropped after the unwind has been caught, so it never gets
    // poisoned.
    let (start, duration, outcome) = {
        let mut task = lock(&shared.tasks[index]);

        shared.set_state(index, TaskState::Running);
        let running = shared.running.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak.fetch_max(running, Ordering::SeqCst);

        let start = Instant::now();
        let outcome =
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.process())) {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!(panic_message(panic))),
            };
        let duration = start.elapsed();

        shared.running.fetch_sub(1, Ordering::SeqCst);
        (start, duration, outcome)
    };

    let error = outcome.err().map(|err| {
        tracing::error!("task '{name}' failed: {err:#}");
        format!("{err:#}")
    });

    // Dependency satisfied, spawn immediately
    for next in shared.complete(index) {
        dispatch(&shared, &sender, next);
    }

    let completion = Completion {
        index,
        execution: TaskExecution {
            start,
            duration,
            worker: workers::current_worker(),
        },
        error,
    };

    if sender.send(completion).is_err() {
        tracing::debug!("frame {} is no longer awaited", shared.frame);
    }
}
