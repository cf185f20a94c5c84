mod pending;

use std::borrow::Cow;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use rayon::ThreadPool;

use crate::config::SchedulerConfig;
use crate::error::QueueError;
use crate::graph::{ArcStr, TaskGraph, TaskNode, check_acyclic};
use crate::queue::pending::PendingDependencies;
use crate::runner::{Diagnostics, Run, TaskState, WorkerPool};
use crate::task::{FunctionTask, IntoTaskResult, Task, TaskId};

enum Phase {
    /// Tasks and dependencies may be added.
    Building,
    /// Tasks are executing on the pool.
    Running(Run),
    /// Every task is done.
    Drained(Diagnostics),
    /// `start_tasks` refused the graph, nothing ran.
    Aborted,
}

/// Owner of one frame's task graph and driver of its parallel execution.
///
/// A frame goes through two phases. While *building*, the queue is mutated
/// through `&mut self` from a single thread: tasks are registered and wired
/// together, either directly by [`TaskId`] or by name. [`TaskQueue::start_tasks`]
/// freezes the graph and hands it to the worker pool; from then on the
/// topology is read-only and only the completion counters change, under a
/// single lock. [`TaskQueue::wait_for_tasks`] blocks until the frame is
/// drained and [`TaskQueue::flush`] makes the queue ready for the next frame.
///
/// Tasks run on `workers` dedicated threads, never more than one task per
/// thread at a time. Data-parallel work inside a task body belongs on
/// [`TaskQueue::compute_pool`] (or rayon's global pool), which can't run
/// other tasks in the meantime.
///
/// # Example
///
/// ```rust
/// use framequeue::TaskQueue;
///
/// let mut queue = TaskQueue::new(2).unwrap();
///
/// let skin = queue.register_fn("SkinTask", || ()).unwrap();
/// queue.add_pending_dependency("AnimatorTask", skin).unwrap();
/// let anim = queue.register_fn("AnimatorTask", || ()).unwrap();
/// let draw = queue.register_fn("DrawTask", || ()).unwrap();
/// queue.add_dependency(skin, draw).unwrap();
///
/// queue.start_tasks().unwrap();
/// let diagnostics = queue.wait_for_tasks().unwrap();
/// assert!(diagnostics.is_success());
/// assert!(diagnostics.edges.contains(&(anim, skin)));
///
/// queue.flush();
/// assert!(queue.is_empty());
/// ```
pub struct TaskQueue {
    config: SchedulerConfig,
    workers: usize,
    pool: WorkerPool,
    compute: Arc<ThreadPool>,
    frame: u64,
    graph: TaskGraph,
    tasks: Vec<Box<dyn Task>>,
    pending: PendingDependencies,
    phase: Phase,
}

impl TaskQueue {
    /// Create a queue backed by a pool of exactly `workers` threads.
    pub fn new(workers: usize) -> Result<Self, QueueError> {
        Self::with_config(SchedulerConfig::new().workers(workers))
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let workers = config.worker_count();
        let pool = WorkerPool::new(workers, &config.thread_name).map_err(QueueError::Spawn)?;

        let prefix = config.thread_name.clone();
        let compute = rayon::ThreadPoolBuilder::new()
            .num_threads(config.compute_threads.unwrap_or(0))
            .thread_name(move |i| format!("{prefix}-compute-{i}"))
            .build()?;

        tracing::debug!(
            "task queue started with {workers} workers and {} compute threads",
            compute.current_num_threads()
        );

        Ok(Self {
            config,
            workers,
            pool,
            compute: Arc::new(compute),
            frame: 0,
            graph: TaskGraph::new(),
            tasks: Vec::new(),
            pending: PendingDependencies::default(),
            phase: Phase::Building,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Size of the worker pool.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Rayon pool for data-parallel work inside task bodies.
    ///
    /// ```
    /// use rayon::prelude::*;
    ///
    /// let mut queue = framequeue::TaskQueue::new(2).unwrap();
    /// let compute = queue.compute_pool();
    /// queue
    ///     .register_fn("SkinTask", move || {
    ///         let total: i64 = compute.install(|| (0..1024i64).into_par_iter().sum());
    ///         assert_eq!(total, 523_776);
    ///     })
    ///     .unwrap();
    ///
    /// queue.start_tasks().unwrap();
    /// assert!(queue.wait_for_tasks().unwrap().is_success());
    /// ```
    pub fn compute_pool(&self) -> Arc<ThreadPool> {
        self.compute.clone()
    }

    /// Current frame generation, advanced by every flush.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of named dependencies waiting for resolution.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Names of the registered tasks, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|node| &*node.name)
    }

    /// Every task registered under `name`.
    pub fn find(&self, name: &str) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&i| &*self.graph[i].name == name)
            .map(|i| self.id(i))
            .collect()
    }

    pub fn name(&self, id: TaskId) -> Result<&str, QueueError> {
        let index = self.node(id)?;
        Ok(&*self.graph[index].name)
    }

    /// Direct dependencies of `id`, i.e. the tasks that must finish first.
    pub fn dependencies(&self, id: TaskId) -> Result<Vec<TaskId>, QueueError> {
        let index = self.node(id)?;
        let mut deps: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|i| self.id(i))
            .collect();
        deps.sort();
        Ok(deps)
    }

    pub fn state(&self, id: TaskId) -> Result<TaskState, QueueError> {
        let index = self.node(id)?;
        Ok(match &self.phase {
            Phase::Building | Phase::Aborted => TaskState::Waiting,
            Phase::Running(run) => run.state(index.index()),
            Phase::Drained(_) => TaskState::Done,
        })
    }

    /// `true` between `start_tasks` and `flush`.
    pub fn is_started(&self) -> bool {
        !matches!(self.phase, Phase::Building)
    }

    fn id(&self, index: NodeIndex) -> TaskId {
        TaskId::new(index, self.frame)
    }

    fn node(&self, id: TaskId) -> Result<NodeIndex, QueueError> {
        if id.frame == self.frame && id.index() < self.graph.node_count() {
            Ok(id.index)
        } else {
            Err(QueueError::UnknownTask(id))
        }
    }

    fn ensure_building(&self) -> Result<(), QueueError> {
        match self.phase {
            Phase::Building => Ok(()),
            _ => Err(QueueError::AlreadyStarted(self.frame)),
        }
    }

    /// Take ownership of a task and return its id for this frame.
    pub fn register_task<T>(&mut self, task: T) -> Result<TaskId, QueueError>
    where
        T: Task + 'static,
    {
        self.ensure_building()?;

        let name: ArcStr = Arc::from(task.name());
        let index = self.graph.add_node(TaskNode { name: name.clone() });
        self.tasks.push(Box::new(task));
        self.pending.record_name(name.clone(), index);

        tracing::debug!("registered task '{name}' as #{}", index.index());

        Ok(self.id(index))
    }

    /// Register a closure as a [`FunctionTask`].
    pub fn register_fn<F, R>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        func: F,
    ) -> Result<TaskId, QueueError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoTaskResult + 'static,
    {
        self.register_task(FunctionTask::new(name, func))
    }

    /// `after` won't start until `before` is done.
    pub fn add_dependency(&mut self, before: TaskId, after: TaskId) -> Result<(), QueueError> {
        self.ensure_building()?;

        let b = self.node(before)?;
        let a = self.node(after)?;

        if a == b {
            return Err(QueueError::SelfDependency(self.graph[a].name.to_string()));
        }

        self.graph.update_edge(b, a, ());
        Ok(())
    }

    /// `after` won't start until every task registered under `before` in
    /// this frame is done, no matter whether that task is registered before
    /// or after this call. If no such task shows up, the constraint is
    /// dropped.
    pub fn add_pending_dependency(
        &mut self,
        before: impl AsRef<str>,
        after: TaskId,
    ) -> Result<(), QueueError> {
        self.ensure_building()?;

        let a = self.node(after)?;
        self.pending.push(Arc::from(before.as_ref()), a);
        Ok(())
    }

    /// Turn named dependencies into direct edges, returning how many edges
    /// were added.
    ///
    /// [`TaskQueue::start_tasks`] calls this itself. Calling it earlier links
    /// the producers registered so far; the named dependencies stay pending,
    /// so producers registered afterwards are still linked at start.
    pub fn resolve_pending_dependencies(&mut self) -> Result<usize, QueueError> {
        self.ensure_building()?;
        Ok(self.resolve_pending(false))
    }

    fn resolve_pending(&mut self, last: bool) -> usize {
        let resolution = self.pending.resolve(self.config.pending_policy);

        let mut added = 0;
        for (before, after) in resolution.edges {
            if self.graph.find_edge(before, after).is_none() {
                self.graph.add_edge(before, after, ());
                added += 1;
            }
        }

        if last {
            for name in &resolution.self_matches {
                tracing::warn!("task '{name}' waits on its own name, skipping the self-match");
            }
            for name in &resolution.dropped {
                tracing::debug!("no task named '{name}' was registered, dropping dependency");
            }
        }

        added
    }

    /// Freeze the graph and begin executing it. Returns without waiting.
    ///
    /// Named dependencies are resolved first. If the resulting graph has a
    /// cycle, nothing runs and the frame is aborted with
    /// [`QueueError::Cycle`].
    pub fn start_tasks(&mut self) -> Result<(), QueueError> {
        self.ensure_building()?;

        self.resolve_pending(true);
        self.pending.clear();

        if let Err(stuck) = check_acyclic(&self.graph, self.frame) {
            tracing::error!(
                "frame {}: {} tasks are stuck in a dependency cycle:\n{stuck}",
                self.frame,
                stuck.len()
            );
            self.phase = Phase::Aborted;
            return Err(QueueError::Cycle {
                frame: self.frame,
                stuck,
            });
        }

        if self.graph.node_count() == 0 {
            self.phase = Phase::Drained(Diagnostics::empty(self.frame, self.workers));
            return Ok(());
        }

        let tasks = std::mem::take(&mut self.tasks);
        let run = Run::start(self.pool.spawner(), self.frame, &self.graph, tasks);
        self.phase = Phase::Running(run);

        Ok(())
    }

    /// Block until every task of the frame is done.
    ///
    /// Failures of individual tasks don't make this return an error; they
    /// are listed in [`Diagnostics::failures`].
    pub fn wait_for_tasks(&mut self) -> Result<Diagnostics, QueueError> {
        match &mut self.phase {
            Phase::Building if self.graph.node_count() == 0 => {
                Ok(Diagnostics::empty(self.frame, self.workers))
            }
            Phase::Building => Err(QueueError::NotStarted(self.frame)),
            Phase::Aborted => Err(QueueError::Aborted(self.frame)),
            Phase::Drained(diagnostics) => Ok(diagnostics.clone()),
            Phase::Running(run) => {
                run.wait()?;

                let Phase::Running(run) = std::mem::replace(&mut self.phase, Phase::Aborted)
                else {
                    unreachable!()
                };

                let diagnostics = run.into_diagnostics(&self.graph, self.workers);
                tracing::debug!(
                    "frame {}: {} tasks done in {:.2?}",
                    self.frame,
                    diagnostics.executed(),
                    diagnostics.wall_time
                );

                self.phase = Phase::Drained(diagnostics.clone());
                Ok(diagnostics)
            }
        }
    }

    /// Drop every task and dependency and move on to the next frame.
    ///
    /// Work still in flight is waited for first. Ids issued before the
    /// flush are rejected afterwards.
    pub fn flush(&mut self) {
        if let Phase::Running(run) = &mut self.phase
            && let Err(err) = run.wait()
        {
            tracing::error!("frame {}: {err}", self.frame);
        }

        self.graph.clear();
        self.tasks.clear();
        self.pending.clear();
        self.phase = Phase::Building;
        self.frame += 1;
    }
}

/// Workers only exit once no job of the current frame is left, so the frame
/// is drained before the pool is torn down.
impl Drop for TaskQueue {
    fn drop(&mut self) {
        if let Phase::Running(run) = &mut self.phase
            && let Err(err) = run.wait()
        {
            tracing::error!("frame {}: {err}", self.frame);
        }
        self.phase = Phase::Aborted;
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("workers", &self.workers)
            .field("frame", &self.frame)
            .field("tasks", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .field("pending", &self.pending.len())
            .field("started", &self.is_started())
            .finish()
    }
}

/// Renders the current graph as a Mermaid diagram. Named dependencies still
/// waiting for `start_tasks` are drawn as dotted edges from a placeholder.
impl std::fmt::Display for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{name}\"]", index.index())?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        for (i, (name, after)) in self.pending.iter().enumerate() {
            let name = name.replace('"', "\\\"");
            writeln!(f, "    P{i}([\"{name}?\"]) -.-> {}", after.index())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PendingPolicy;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rayon::prelude::*;
    use std::sync::mpsc::channel;

    type Log = Arc<Mutex<Vec<(&'static str, Instant, Instant)>>>;

    /// Registers a task that records its start and end timestamps.
    fn timed(queue: &mut TaskQueue, log: &Log, name: &'static str, work: Duration) -> TaskId {
        let log = log.clone();
        queue
            .register_fn(name, move || {
                let start = Instant::now();
                std::thread::sleep(work);
                log.lock().unwrap().push((name, start, Instant::now()));
            })
            .unwrap()
    }

    fn span_of(log: &Log, name: &str) -> (Instant, Instant) {
        let log = log.lock().unwrap();
        let (_, start, end) = log.iter().find(|(n, ..)| *n == name).unwrap();
        (*start, *end)
    }

    fn run(queue: &mut TaskQueue) -> Diagnostics {
        queue.start_tasks().unwrap();
        queue.wait_for_tasks().unwrap()
    }

    #[test]
    fn test_diamond_with_two_workers() {
        let mut queue = TaskQueue::new(2).unwrap();
        let log: Log = Default::default();
        let count = Arc::new(AtomicUsize::new(0));

        let a = timed(&mut queue, &log, "A", Duration::from_millis(5));

        // B and C each wait (bounded) for the other one to be running.
        let b_running = Arc::new(AtomicBool::new(false));
        let c_running = Arc::new(AtomicBool::new(false));
        let overlap = Arc::new(AtomicUsize::new(0));

        let mut sibling = |name: &'static str, me: &Arc<AtomicBool>, other: &Arc<AtomicBool>| {
            let (me, other, overlap, log, count) = (
                me.clone(),
                other.clone(),
                overlap.clone(),
                log.clone(),
                count.clone(),
            );
            queue
                .register_fn(name, move || {
                    let start = Instant::now();
                    count.fetch_add(1, Ordering::SeqCst);
                    me.store(true, Ordering::SeqCst);
                    let deadline = Instant::now() + Duration::from_secs(5);
                    while !other.load(Ordering::SeqCst) && Instant::now() < deadline {
                        std::thread::yield_now();
                    }
                    if other.load(Ordering::SeqCst) {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    log.lock().unwrap().push((name, start, Instant::now()));
                })
                .unwrap()
        };

        let b = sibling("B", &b_running, &c_running);
        let c = sibling("C", &c_running, &b_running);
        let d = timed(&mut queue, &log, "D", Duration::ZERO);

        queue.add_dependency(a, b).unwrap();
        queue.add_dependency(a, c).unwrap();
        queue.add_dependency(b, d).unwrap();
        queue.add_dependency(c, d).unwrap();

        let diagnostics = run(&mut queue);

        assert!(diagnostics.is_success());
        assert_eq!(diagnostics.executed(), 4);
        assert_eq!(log.lock().unwrap().len(), 4);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(overlap.load(Ordering::SeqCst), 2);
        assert!(diagnostics.peak_concurrency <= 2);

        let (_, a_end) = span_of(&log, "A");
        let (b_start, b_end) = span_of(&log, "B");
        let (c_start, c_end) = span_of(&log, "C");
        let (d_start, _) = span_of(&log, "D");
        assert!(a_end <= b_start && a_end <= c_start);
        assert!(b_end <= d_start && c_end <= d_start);

        for id in [a, b, c, d] {
            assert_eq!(queue.state(id).unwrap(), TaskState::Done);
        }
    }

    #[test]
    fn test_ordering_randomized() {
        let mut rng = StdRng::seed_from_u64(0x5EED);

        for _ in 0..20 {
            let workers = rng.random_range(1..=4);
            let mut queue = TaskQueue::new(workers).unwrap();
            let log: Log = Default::default();

            const NAMES: [&str; 10] = ["t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7", "t8", "t9"];
            let ids: Vec<TaskId> = NAMES
                .iter()
                .map(|name| {
                    let work = Duration::from_micros(rng.random_range(0..300));
                    timed(&mut queue, &log, *name, work)
                })
                .collect();

            // Edges only go forward, so the graph is acyclic.
            let mut edges = Vec::new();
            for after in 1..ids.len() {
                for before in 0..after {
                    if rng.random_bool(0.3) {
                        queue.add_dependency(ids[before], ids[after]).unwrap();
                        edges.push((before, after));
                    }
                }
            }

            let diagnostics = run(&mut queue);
            assert_eq!(diagnostics.executed(), NAMES.len());
            assert!(diagnostics.peak_concurrency <= workers);
            assert_eq!(log.lock().unwrap().len(), NAMES.len());

            for (before, after) in edges {
                let (_, before_end) = span_of(&log, NAMES[before]);
                let (after_start, _) = span_of(&log, NAMES[after]);
                assert!(before_end <= after_start, "{before} -> {after} overlapped");
            }
        }
    }

    #[test]
    fn test_parallelism_bound() {
        let workers = 3;
        let mut queue = TaskQueue::new(workers).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..24 {
            let (current, peak) = (current.clone(), peak.clone());
            queue
                .register_fn(format!("leaf-{i}"), move || {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(2));
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        let diagnostics = run(&mut queue);

        assert_eq!(diagnostics.executed(), 24);
        assert!(peak.load(Ordering::SeqCst) <= workers);
        assert!(diagnostics.peak_concurrency <= workers);
    }

    #[test]
    fn test_single_worker_serializes() {
        let mut queue = TaskQueue::new(1).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            let (current, peak) = (current.clone(), peak.clone());
            queue
                .register_fn(format!("job-{i}"), move || {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        run(&mut queue);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    /// Registers `count` tasks whose bodies fan out over rayon while they
    /// track how many of them are inside their body at once.
    fn nested_parallel_tasks(
        queue: &mut TaskQueue,
        count: usize,
        compute: Option<Arc<ThreadPool>>,
    ) -> (Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let threads = Arc::new(Mutex::new(Vec::new()));

        for i in 0..count {
            let (current, peak, threads) = (current.clone(), peak.clone(), threads.clone());
            let compute = compute.clone();
            queue
                .register_fn(format!("skin-{i}"), move || {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);

                    let name = std::thread::current().name().unwrap_or_default().to_string();
                    threads.lock().unwrap().push(name);

                    let work = || {
                        (0..64)
                            .into_par_iter()
                            .for_each(|_| std::thread::sleep(Duration::from_micros(200)))
                    };
                    match &compute {
                        Some(pool) => pool.install(work),
                        None => work(),
                    }

                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        (peak, threads)
    }

    #[test]
    fn test_nested_rayon_work_stays_within_worker_limit() {
        let mut queue = TaskQueue::new(2).unwrap();
        let (peak, threads) = nested_parallel_tasks(&mut queue, 16, None);

        let diagnostics = run(&mut queue);

        assert_eq!(diagnostics.executed(), 16);
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
        assert!(diagnostics.peak_concurrency <= 2);
        for name in threads.lock().unwrap().iter() {
            assert!(name.starts_with("frame-worker-"), "task body ran on {name}");
        }
    }

    #[test]
    fn test_compute_pool_work_stays_within_worker_limit() {
        let config = SchedulerConfig::new().workers(2).compute_threads(4);
        let mut queue = TaskQueue::with_config(config).unwrap();
        let compute = queue.compute_pool();
        assert_eq!(compute.current_num_threads(), 4);

        let (peak, _) = nested_parallel_tasks(&mut queue, 16, Some(compute));
        let diagnostics = run(&mut queue);

        assert!(diagnostics.is_success());
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
        assert!(diagnostics.peak_concurrency <= 2);
    }

    #[test]
    fn test_running_state_follows_the_executing_task() {
        let mut queue = TaskQueue::new(1).unwrap();
        let (started_tx, started_rx) = channel();
        let release = Arc::new(AtomicBool::new(false));

        let mut ids = Vec::new();
        for name in ["first", "second"] {
            let (started, release) = (started_tx.clone(), release.clone());
            let id = queue
                .register_fn(name, move || {
                    started.send(name).unwrap();
                    while !release.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                })
                .unwrap();
            ids.push((name, id));
        }

        queue.start_tasks().unwrap();
        let running = started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for (name, id) in &ids {
            let expected = if *name == running {
                TaskState::Running
            } else {
                TaskState::Ready
            };
            assert_eq!(queue.state(*id).unwrap(), expected, "{name}");
        }

        release.store(true, Ordering::SeqCst);
        queue.wait_for_tasks().unwrap();
        for (_, id) in &ids {
            assert_eq!(queue.state(*id).unwrap(), TaskState::Done);
        }
    }

    #[test]
    fn test_named_dependency_registered_later() {
        let mut queue = TaskQueue::new(4).unwrap();
        let log: Log = Default::default();

        // The skinning system runs first and only knows the animator by name.
        let skin = timed(&mut queue, &log, "SkinTask", Duration::ZERO);
        queue.add_pending_dependency("AnimatorTask", skin).unwrap();
        assert_eq!(queue.pending_len(), 1);

        let anim = timed(&mut queue, &log, "AnimatorTask", Duration::from_millis(10));

        let diagnostics = run(&mut queue);

        let (_, anim_end) = span_of(&log, "AnimatorTask");
        let (skin_start, _) = span_of(&log, "SkinTask");
        assert!(anim_end <= skin_start);
        assert_eq!(diagnostics.edges, vec![(anim, skin)]);
    }

    #[test]
    fn test_named_dependency_on_all_matches() {
        let mut queue = TaskQueue::new(2).unwrap();
        let log: Log = Default::default();

        let render = timed(&mut queue, &log, "Render", Duration::ZERO);
        queue.add_pending_dependency("Physics", render).unwrap();
        let p1 = timed(&mut queue, &log, "Physics", Duration::from_millis(3));
        let p2 = timed(&mut queue, &log, "Physics", Duration::from_millis(3));

        queue.start_tasks().unwrap();
        assert_eq!(queue.dependencies(render).unwrap(), vec![p1, p2]);
        queue.wait_for_tasks().unwrap();

        let (render_start, _) = span_of(&log, "Render");
        for (name, _, end) in log.lock().unwrap().iter() {
            if *name == "Physics" {
                assert!(*end <= render_start);
            }
        }
    }

    #[test]
    fn test_named_dependency_first_policy() {
        let config = SchedulerConfig::new()
            .workers(2)
            .pending_policy(PendingPolicy::First);
        let mut queue = TaskQueue::with_config(config).unwrap();

        let render = queue.register_fn("Render", || ()).unwrap();
        queue.add_pending_dependency("Physics", render).unwrap();
        let p1 = queue.register_fn("Physics", || ()).unwrap();
        queue.register_fn("Physics", || ()).unwrap();

        assert_eq!(queue.resolve_pending_dependencies().unwrap(), 1);
        assert_eq!(queue.dependencies(render).unwrap(), vec![p1]);
        run(&mut queue);
    }

    #[test]
    fn test_early_resolution_links_later_producers() {
        let mut queue = TaskQueue::new(4).unwrap();
        let log: Log = Default::default();

        let skin = timed(&mut queue, &log, "SkinTask", Duration::ZERO);
        queue.add_pending_dependency("AnimatorTask", skin).unwrap();
        assert_eq!(queue.resolve_pending_dependencies().unwrap(), 0);
        assert_eq!(queue.pending_len(), 1);

        let anim = timed(&mut queue, &log, "AnimatorTask", Duration::from_millis(10));
        assert_eq!(queue.resolve_pending_dependencies().unwrap(), 1);
        assert_eq!(queue.resolve_pending_dependencies().unwrap(), 0);

        let diagnostics = run(&mut queue);
        assert_eq!(diagnostics.edges, vec![(anim, skin)]);

        let (_, anim_end) = span_of(&log, "AnimatorTask");
        let (skin_start, _) = span_of(&log, "SkinTask");
        assert!(anim_end <= skin_start);
    }

    #[test]
    fn test_unresolved_named_dependency_is_dropped() {
        let mut queue = TaskQueue::new(2).unwrap();
        let orphan = queue.register_fn("Orphan", || ()).unwrap();
        queue
            .add_pending_dependency("NeverRegistered", orphan)
            .unwrap();

        let started = Instant::now();
        let diagnostics = run(&mut queue);

        assert!(diagnostics.is_success());
        assert_eq!(diagnostics.executed(), 1);
        assert!(diagnostics.edges.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_direct_cycle_is_reported() {
        let mut queue = TaskQueue::new(2).unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let r = ran.clone();
        let a = queue.register_fn("A", move || r.store(true, Ordering::SeqCst)).unwrap();
        let r = ran.clone();
        let b = queue.register_fn("B", move || r.store(true, Ordering::SeqCst)).unwrap();
        let r = ran.clone();
        let free = queue.register_fn("Free", move || r.store(true, Ordering::SeqCst)).unwrap();
        queue.add_dependency(a, b).unwrap();
        queue.add_dependency(b, a).unwrap();

        let err = queue.start_tasks().unwrap_err();
        let QueueError::Cycle { stuck, .. } = &err else {
            panic!("expected a cycle, got {err}");
        };
        assert_eq!(stuck.len(), 2);
        assert!(stuck.contains("A") && stuck.contains("B"));
        assert!(err.to_string().contains("'A' is waiting on: B"));

        // Nothing ran, not even the independent task.
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(queue.state(free).unwrap(), TaskState::Waiting);
        assert!(matches!(queue.wait_for_tasks(), Err(QueueError::Aborted(_))));

        queue.flush();
        assert!(queue.is_empty());
        queue.register_fn("Next", || ()).unwrap();
        run(&mut queue);
    }

    #[test]
    fn test_cycle_through_named_dependencies() {
        let mut queue = TaskQueue::new(2).unwrap();
        let a = queue.register_fn("A", || ()).unwrap();
        let b = queue.register_fn("B", || ()).unwrap();
        queue.add_dependency(a, b).unwrap();
        queue.add_pending_dependency("B", a).unwrap();

        assert!(matches!(
            queue.start_tasks(),
            Err(QueueError::Cycle { .. })
        ));
    }

    #[test]
    fn test_registration_errors() {
        let mut queue = TaskQueue::new(1).unwrap();
        let a = queue.register_fn("A", || ()).unwrap();

        assert!(matches!(
            queue.add_dependency(a, a),
            Err(QueueError::SelfDependency(name)) if name == "A"
        ));

        let bogus = TaskId::new(NodeIndex::new(42), queue.frame());
        assert!(matches!(
            queue.add_dependency(a, bogus),
            Err(QueueError::UnknownTask(_))
        ));
        assert!(matches!(
            queue.add_pending_dependency("A", bogus),
            Err(QueueError::UnknownTask(_))
        ));

        queue.start_tasks().unwrap();
        assert!(matches!(
            queue.register_fn("Late", || ()),
            Err(QueueError::AlreadyStarted(_))
        ));
        assert!(matches!(
            queue.start_tasks(),
            Err(QueueError::AlreadyStarted(_))
        ));
        queue.wait_for_tasks().unwrap();
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let mut queue = TaskQueue::new(2).unwrap();
        let a = queue.register_fn("A", || ()).unwrap();
        let b = queue.register_fn("B", || ()).unwrap();
        queue.add_dependency(a, b).unwrap();
        queue.add_dependency(a, b).unwrap();
        queue.add_pending_dependency("A", b).unwrap();

        let diagnostics = run(&mut queue);
        assert_eq!(diagnostics.edges.len(), 1);
        assert_eq!(diagnostics.executed(), 2);
    }

    #[test]
    fn test_failure_is_isolated() {
        let mut queue = TaskQueue::new(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let bad = queue
            .register_fn("Skinning", || -> anyhow::Result<()> {
                anyhow::bail!("joint count mismatch")
            })
            .unwrap();
        let r = ran.clone();
        let render = queue
            .register_fn("Render", move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let r = ran.clone();
        queue
            .register_fn("Audio", move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        queue.add_dependency(bad, render).unwrap();

        let diagnostics = run(&mut queue);

        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(!diagnostics.is_success());
        assert_eq!(diagnostics.failures.len(), 1);
        assert_eq!(diagnostics.failures[0].id, bad);
        assert!(diagnostics.failures[0].message.contains("joint count mismatch"));
    }

    #[test]
    fn test_wait_on_empty_queue() {
        let mut queue = TaskQueue::new(2).unwrap();
        assert_eq!(queue.wait_for_tasks().unwrap().executed(), 0);

        queue.start_tasks().unwrap();
        let diagnostics = queue.wait_for_tasks().unwrap();
        assert_eq!(diagnostics.executed(), 0);
        assert!(diagnostics.is_success());
    }

    #[test]
    fn test_wait_without_start() {
        let mut queue = TaskQueue::new(1).unwrap();
        queue.register_fn("A", || ()).unwrap();
        assert!(matches!(
            queue.wait_for_tasks(),
            Err(QueueError::NotStarted(0))
        ));
    }

    #[test]
    fn test_flush_resets_the_queue() {
        let mut queue = TaskQueue::new(2).unwrap();
        let a = queue.register_fn("A", || ()).unwrap();
        let b = queue.register_fn("B", || ()).unwrap();
        queue.add_dependency(a, b).unwrap();
        queue.add_pending_dependency("Nope", b).unwrap();
        run(&mut queue);
        queue.flush();

        assert!(queue.is_empty());
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.names().count(), 0);
        assert!(!queue.is_started());
        assert!(matches!(
            queue.add_dependency(a, b),
            Err(QueueError::UnknownTask(_))
        ));

        // The new frame reuses slot 0 and 1 without the old edge.
        let c = queue.register_fn("C", || ()).unwrap();
        let d = queue.register_fn("D", || ()).unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert!(queue.dependencies(d).unwrap().is_empty());

        let diagnostics = run(&mut queue);
        assert!(diagnostics.edges.is_empty());
        assert_eq!(diagnostics.frame, 1);
    }

    #[test]
    fn test_flush_waits_for_running_tasks() {
        let mut queue = TaskQueue::new(2).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        queue
            .register_fn("Slow", move || {
                std::thread::sleep(Duration::from_millis(20));
                d.store(true, Ordering::SeqCst);
            })
            .unwrap();

        queue.start_tasks().unwrap();
        queue.flush();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_display_lists_tasks_and_edges() {
        let mut queue = TaskQueue::new(1).unwrap();
        let a = queue.register_fn("Animator", || ()).unwrap();
        let b = queue.register_fn("Skin \"gpu\"", || ()).unwrap();
        queue.add_dependency(a, b).unwrap();
        queue.add_pending_dependency("Physics", b).unwrap();

        let text = queue.to_string();
        assert!(text.starts_with("graph LR"));
        assert!(text.contains(r#"0["Animator"]"#));
        assert!(text.contains(r#"1["Skin \"gpu\""]"#));
        assert!(text.contains("0 --> 1"));
        assert!(text.contains(r#"P0(["Physics?"]) -.-> 1"#));
        assert!(text.lines().any(|line| line == "    0 --> 1"));
        assert_eq!(queue.find("Animator"), vec![a]);
        assert_eq!(queue.name(b).unwrap(), "Skin \"gpu\"");
    }
}
