use std::collections::HashMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ExecutionMode, JobSpec};
use crate::gateway::BackendId;

/// Unique identifier for an optimization job.
///
/// Process-unique; identifiers are never reused within a process
/// lifetime. Rendered as a string everywhere user-facing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle states.
///
/// `Created` and the three terminal states are stable; the others are
/// transient and must resolve or be forced into `Failed` by a
/// configured timeout.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Provisioning,
    Deploying,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Provisioning => "provisioning",
            JobState::Deploying => "deploying",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Aborted => "aborted",
        }
    }

    /// Whether the state is final. Results are frozen once a job is
    /// terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Aborted
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single scored candidate solution reported by a backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Parameter vector of the candidate.
    pub params: Vec<f64>,
    /// Objective score at those parameters.
    pub score: f64,
    /// Index of the worker that reported this candidate.
    pub worker: usize,
}

impl Target {
    pub fn new(params: Vec<f64>, score: f64, worker: usize) -> Self {
        Self {
            params,
            score,
            worker,
        }
    }
}

/// One submitted optimization run.
///
/// Owned by the orchestrator's registry for its entire lifetime and
/// never handed out directly; callers see [`ResultSnapshot`] copies.
/// The referenced model never changes once the identifier is assigned.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub model_name: String,
    pub spec: JobSpec,
    pub mode: ExecutionMode,
    pub state: JobState,
    /// Backends acquired for this job, in acquisition order. Empty
    /// until provisioning succeeds.
    pub backends: Vec<BackendId>,
    /// Accumulates monotonically while `Running`, frozen at terminal
    /// states.
    pub targets: Vec<Target>,
    /// Human-readable cause when the job reached `Failed`.
    pub failure: Option<String>,
    /// Backends whose release failed. Non-empty means a provisioned
    /// resource may still be incurring cost.
    pub orphaned: Vec<BackendId>,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(model_name: impl Into<String>, spec: JobSpec) -> Self {
        let mode = spec.execution_mode();
        Self {
            id: JobId::new(),
            model_name: model_name.into(),
            spec,
            mode,
            state: JobState::Created,
            backends: Vec::new(),
            targets: Vec::new(),
            failure: None,
            orphaned: Vec::new(),
            submitted_at: Utc::now(),
        }
    }

    /// Take a consistent read-only snapshot of the job.
    pub fn snapshot(&self) -> ResultSnapshot {
        ResultSnapshot {
            job_id: self.id,
            state: self.state,
            targets: self.targets.clone(),
            failure: self.failure.clone(),
            orphaned_backends: self.orphaned.clone(),
            sampled_at: Utc::now(),
        }
    }

    /// Best target observed so far, by minimal score.
    pub fn best_target(&self) -> Option<&Target> {
        self.targets
            .iter()
            .min_by(|a, b| a.score.total_cmp(&b.score))
    }
}

/// Read-only view of a job's state and accumulated results.
///
/// State and targets are captured under the same lock; a snapshot is
/// never torn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultSnapshot {
    pub job_id: JobId,
    pub state: JobState,
    pub targets: Vec<Target>,
    pub failure: Option<String>,
    /// Backends that could not be released. A non-empty list is a cost
    /// warning, distinct from ordinary job failure.
    pub orphaned_backends: Vec<BackendId>,
    pub sampled_at: DateTime<Utc>,
}

impl ResultSnapshot {
    pub fn best_target(&self) -> Option<&Target> {
        self.targets
            .iter()
            .min_by(|a, b| a.score.total_cmp(&b.score))
    }
}

/// Per-caller watermark for result observation.
///
/// `has_new_results` compares a job's accumulated target count against
/// the count this cursor last saw, so independent callers (an
/// interactive shell, a status poller) each track their own "new since
/// I last looked" without blocking waits.
#[derive(Clone, Debug, Default)]
pub struct ResultCursor {
    seen: HashMap<JobId, usize>,
}

impl ResultCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation and report whether anything was new.
    pub fn observe(&mut self, job_id: JobId, total: usize) -> bool {
        let seen = self.seen.entry(job_id).or_insert(0);
        let fresh = total > *seen;
        *seen = total;
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobSpec;

    #[test]
    fn test_job_state_terminality() {
        assert!(!JobState::Created.is_terminal());
        assert!(!JobState::Provisioning.is_terminal());
        assert!(!JobState::Deploying.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Aborted.is_terminal());
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(!a.to_string().is_empty());
    }

    #[test]
    fn test_new_job_starts_created_and_empty() {
        let job = Job::new("sphere", JobSpec::default());
        assert_eq!(job.state, JobState::Created);
        assert!(job.targets.is_empty());
        assert!(job.backends.is_empty());
        assert!(job.failure.is_none());
    }

    #[test]
    fn test_best_target_minimizes_score() {
        let mut job = Job::new("sphere", JobSpec::default());
        job.targets.push(Target::new(vec![1.0], 3.5, 0));
        job.targets.push(Target::new(vec![0.2], -1.25, 1));
        job.targets.push(Target::new(vec![0.9], 0.0, 0));

        let best = job.best_target().unwrap();
        assert_eq!(best.score, -1.25);
    }

    #[test]
    fn test_cursor_reports_new_results_once() {
        let mut cursor = ResultCursor::new();
        let id = JobId::new();

        assert!(!cursor.observe(id, 0));
        assert!(cursor.observe(id, 2));
        assert!(!cursor.observe(id, 2));
        assert!(cursor.observe(id, 5));
    }
}
