#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod error;
mod frame;
mod graph;
mod queue;
mod runner;
mod task;
mod utils;

pub use crate::config::{PendingPolicy, SchedulerConfig, default_workers};
pub use crate::error::{QueueError, StuckTask, StuckTasks, TaskError};
pub use crate::frame::{FrameDriver, FrameInfo, Registrar, System};
pub use crate::queue::TaskQueue;
pub use crate::runner::{Diagnostics, TaskExecution, TaskFailure, TaskState};
pub use crate::task::{FunctionTask, IntoTaskResult, Task, TaskId, TaskResult};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
