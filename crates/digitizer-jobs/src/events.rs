//! Worker lifecycle events and observers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
    /// A job was claimed and its handler started.
    JobActive {
        job_id: Uuid,
        job_type: String,
        attempt: i32,
    },
    /// Job progress was updated.
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: Uuid,
        job_type: String,
        duration_ms: u64,
    },
    /// An attempt failed. `will_retry` is false once attempts are exhausted.
    JobFailed {
        job_id: Uuid,
        job_type: String,
        attempts_made: i32,
        will_retry: bool,
        error: String,
    },
    /// An exhausted job was stored in the dead letter queue.
    JobDeadLettered { job_id: Uuid, entry_id: Uuid },
}

/// Receives worker events.
#[async_trait]
pub trait WorkerObserver: Send + Sync {
    async fn on_event(&self, event: &WorkerEvent);
}

/// Active observer registration.
///
/// Delivery stops when the subscription is cancelled or dropped.
#[must_use = "dropping a Subscription stops event delivery"]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Start delivering events from `rx` to `observer`.
    pub(crate) fn spawn(
        mut rx: broadcast::Receiver<WorkerEvent>,
        observer: Arc<dyn WorkerObserver>,
    ) -> Self {
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => observer.on_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Worker observer lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { task }
    }

    /// Stop delivering events.
    pub fn cancel(self) {
        self.task.abort();
    }

    /// Whether delivery is still running.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Observer that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

#[async_trait]
impl WorkerObserver for LoggingObserver {
    async fn on_event(&self, event: &WorkerEvent) {
        match event {
            WorkerEvent::WorkerStarted => info!(component = "worker", "Worker ready"),
            WorkerEvent::WorkerStopped => info!(component = "worker", "Worker stopped"),
            WorkerEvent::JobActive {
                job_id,
                job_type,
                attempt,
            } => info!(
                component = "worker",
                job_id = %job_id,
                job_type = %job_type,
                attempt,
                "Job active"
            ),
            WorkerEvent::JobProgress {
                job_id, percent, ..
            } => info!(
                component = "worker",
                job_id = %job_id,
                progress = percent,
                "Job progress"
            ),
            WorkerEvent::JobCompleted {
                job_id,
                job_type,
                duration_ms,
            } => info!(
                component = "worker",
                job_id = %job_id,
                job_type = %job_type,
                duration_ms,
                "Job completed"
            ),
            WorkerEvent::JobFailed {
                job_id,
                attempts_made,
                will_retry: true,
                error,
                ..
            } => warn!(
                component = "worker",
                job_id = %job_id,
                attempt = attempts_made,
                error = %error,
                "Job attempt failed, will retry"
            ),
            WorkerEvent::JobFailed {
                job_id,
                attempts_made,
                error,
                ..
            } => error!(
                component = "worker",
                job_id = %job_id,
                attempt = attempts_made,
                error = %error,
                "Job failed after final attempt"
            ),
            WorkerEvent::JobDeadLettered { job_id, entry_id } => error!(
                component = "worker",
                job_id = %job_id,
                entry_id = %entry_id,
                "Job moved to dead letter queue"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<WorkerEvent>>,
    }

    #[async_trait]
    impl WorkerObserver for Recorder {
        async fn on_event(&self, event: &WorkerEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn test_subscription_delivers_until_cancelled() {
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(Recorder::default());
        let sub = Subscription::spawn(rx, recorder.clone());

        tx.send(WorkerEvent::WorkerStarted).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sub.is_active());
        sub.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.send(WorkerEvent::WorkerStopped);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![WorkerEvent::WorkerStarted]
        );
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_delivery() {
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(Recorder::default());
        drop(Subscription::spawn(rx, recorder.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = tx.send(WorkerEvent::WorkerStarted);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logging_observer_handles_every_event() {
        let id = Uuid::new_v4();
        let events = [
            WorkerEvent::WorkerStarted,
            WorkerEvent::JobActive {
                job_id: id,
                job_type: "t".into(),
                attempt: 1,
            },
            WorkerEvent::JobFailed {
                job_id: id,
                job_type: "t".into(),
                attempts_made: 3,
                will_retry: false,
                error: "boom".into(),
            },
            WorkerEvent::JobDeadLettered {
                job_id: id,
                entry_id: Uuid::new_v4(),
            },
            WorkerEvent::WorkerStopped,
        ];
        for event in &events {
            LoggingObserver.on_event(event).await;
        }
    }
}
