use std::cell::Cell;
use std::io;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the scheduler worker running on this thread, if any.
pub(crate) fn current_worker() -> Option<usize> {
    WORKER.get()
}

/// Fixed set of OS threads executing scheduler jobs, one job at a time.
///
/// These are plain threads, not rayon workers. A task body blocking in a
/// `par_iter` or `join` hands that work to a rayon pool, which has no way of
/// picking up scheduler jobs, so a worker never starts a second task while
/// the first one is still inside its body.
pub(crate) struct WorkerPool {
    spawner: Spawner,
    threads: Vec<JoinHandle<()>>,
}

/// Cloneable handle queueing jobs on a [`WorkerPool`].
///
/// Workers exit once every spawner is gone and the queue is empty.
#[derive(Clone)]
pub(crate) struct Spawner(flume::Sender<Job>);

impl Spawner {
    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        if self.0.send(Box::new(job)).is_err() {
            tracing::error!("every scheduler worker has exited, dropping job");
        }
    }
}

impl WorkerPool {
    pub(crate) fn new(workers: usize, prefix: &str) -> io::Result<Self> {
        let (sender, receiver) = flume::unbounded::<Job>();

        let threads = (0..workers)
            .map(|index| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("{prefix}-{index}"))
                    .spawn(move || {
                        WORKER.set(Some(index));
                        for job in receiver.iter() {
                            job();
                        }
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            spawner: Spawner(sender),
            threads,
        })
    }

    pub(crate) fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Swap in a sender of a dead channel so ours disconnects.
        let (closed, _) = flume::unbounded();
        self.spawner = Spawner(closed);

        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!("a scheduler worker panicked outside of a task");
            }
        }
    }
}
