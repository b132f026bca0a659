use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::gateway::BackendId;
use crate::job::{JobId, JobState};

/// A job lifecycle event.
#[derive(Clone, Debug)]
pub struct JobEvent {
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(job_id: JobId, payload: JobEventPayload) -> Self {
        Self {
            job_id,
            at: Utc::now(),
            payload,
        }
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum JobEventPayload {
    /// A job entered the registry.
    Submitted { model: String },
    /// The job's lifecycle state changed.
    StateChanged { from: JobState, to: JobState },
    /// New targets were appended to the job's results.
    ResultsAppended { appended: usize, total: usize },
    /// A backend's release failed and it may still be incurring cost.
    BackendOrphaned { backend: BackendId },
}

/// Sink for job lifecycle events.
///
/// Publishing must never block job progress; slow subscribers lag
/// instead of applying backpressure.
pub trait JobEventSink: Send + Sync {
    fn publish(&self, event: JobEvent);
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Fan-out to all active subscribers. When a subscriber falls behind
/// the channel capacity it receives `RecvError::Lagged` rather than
/// stalling the publisher. Events don't leave the process.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a bus buffering at most `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl JobEventSink for InProcEventBus {
    /// Non-blocking publish. Events are dropped silently when no
    /// subscriber exists.
    fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}
