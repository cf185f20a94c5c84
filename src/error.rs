use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::task::TaskId;

pub use anyhow::Error as TaskError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task {0:?} is not registered in the current frame")]
    UnknownTask(TaskId),

    #[error("Task '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Tasks for frame {0} are already running, the graph is frozen until flush")]
    AlreadyStarted(u64),

    #[error("Tasks were registered for frame {0} but never started")]
    NotStarted(u64),

    #[error("Frame {0} was aborted before any task ran")]
    Aborted(u64),

    #[error("Dependency cycle detected in frame {frame}:\n{stuck}")]
    Cycle { frame: u64, stuck: StuckTasks },

    #[error("System '{system}' failed to generate tasks:\n{error}")]
    System {
        system: String,
        error: anyhow::Error,
    },

    #[error("Worker pool stopped reporting before the frame was drained")]
    WorkersLost,

    #[error("Invalid scheduler configuration: {0}")]
    Config(String),

    #[error("Couldn't parse scheduler configuration.\n{0}")]
    ConfigFormat(#[from] serde_json::Error),

    #[error("Couldn't read scheduler configuration.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't start a worker thread.\n{0}")]
    Spawn(std::io::Error),

    #[error("Couldn't build the compute pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A task left behind when the scheduler can't make progress, together with
/// the names of the dependencies that never completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckTask {
    pub id: TaskId,
    pub name: String,
    pub waiting_on: Vec<String>,
}

/// Every task that can't be scheduled because of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StuckTasks(pub Vec<StuckTask>);

impl StuckTasks {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StuckTask> {
        self.0.iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|task| task.name == name)
    }
}

impl Display for StuckTasks {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for task in &self.0 {
            writeln!(
                f,
                "  '{}' is waiting on: {}",
                task.name,
                task.waiting_on.join(", ")
            )?;
        }
        Ok(())
    }
}
