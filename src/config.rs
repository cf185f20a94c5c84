use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// How a named dependency is linked when several tasks share the name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPolicy {
    /// Depend on every task registered under the name.
    #[default]
    All,
    /// Depend only on the earliest registered task with the name.
    First,
}

/// Settings for a [`crate::TaskQueue`].
///
/// Every field has a default, so a config file only needs to mention what it
/// overrides:
///
/// ```
/// use framequeue::{PendingPolicy, SchedulerConfig};
///
/// let config = SchedulerConfig::from_json(r#"{ "workers": 2 }"#).unwrap();
/// assert_eq!(config.worker_count(), 2);
/// assert_eq!(config.pending_policy, PendingPolicy::All);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the worker pool. `None` picks [`default_workers`].
    pub workers: Option<usize>,
    /// Resolution policy for named dependencies.
    pub pending_policy: PendingPolicy,
    /// Prefix of the worker thread names.
    pub thread_name: String,
    /// Size of the rayon pool task bodies use for data-parallel work.
    /// `None` leaves the choice to rayon.
    pub compute_threads: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            pending_policy: PendingPolicy::default(),
            thread_name: "frame-worker".to_string(),
            compute_threads: None,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn pending_policy(mut self, policy: PendingPolicy) -> Self {
        self.pending_policy = policy;
        self
    }

    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    pub fn compute_threads(mut self, threads: usize) -> Self {
        self.compute_threads = Some(threads);
        self
    }

    /// Number of workers this config resolves to.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_workers)
    }

    pub fn from_json(text: &str) -> Result<Self, QueueError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read the config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub(crate) fn validate(&self) -> Result<(), QueueError> {
        if self.workers == Some(0) {
            return Err(QueueError::Config(
                "worker pool needs at least one thread".into(),
            ));
        }
        if self.compute_threads == Some(0) {
            return Err(QueueError::Config(
                "compute pool needs at least one thread".into(),
            ));
        }
        Ok(())
    }
}

/// One worker per core, minus the core kept for the frame driver.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}
