//! Typed events published while defining and running jobs.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::JobId;

/// Snapshot of the manager's job sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobSetsSnapshot {
    pub targets: BTreeSet<JobId>,
    pub all_targets: BTreeSet<JobId>,
    pub done: BTreeSet<JobId>,
    pub failed: BTreeSet<JobId>,
    pub blocked: BTreeSet<JobId>,
    pub todo: BTreeSet<JobId>,
    pub ready_todo: BTreeSet<JobId>,
    pub processing: BTreeSet<JobId>,
    pub deleted: BTreeSet<JobId>,
}

/// Event emitted by the definition engine and the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    JobDefined {
        job_id: JobId,
    },
    JobRedefined {
        job_id: JobId,
        reason: String,
    },
    ManagerJobProcessing {
        job_id: JobId,
    },
    ManagerJobDone {
        job_id: JobId,
    },
    ManagerJobFailed {
        job_id: JobId,
        reason: String,
    },
    ManagerJobBlocked {
        job_id: JobId,
        blocking_job_id: JobId,
    },
    ManagerJobReady {
        job_id: JobId,
    },
    ManagerHostFailed {
        job_id: JobId,
        reason: String,
    },
    ManagerProgress(JobSetsSnapshot),
    ManagerSucceeded {
        nothing_to_do: bool,
        sets: JobSetsSnapshot,
    },
    ManagerWait {
        reasons: BTreeMap<String, String>,
    },
    ManagerInterrupted {
        reason: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::JobDefined { .. } => "job-defined",
            Event::JobRedefined { .. } => "job-redefined",
            Event::ManagerJobProcessing { .. } => "manager-job-processing",
            Event::ManagerJobDone { .. } => "manager-job-done",
            Event::ManagerJobFailed { .. } => "manager-job-failed",
            Event::ManagerJobBlocked { .. } => "manager-job-blocked",
            Event::ManagerJobReady { .. } => "manager-job-ready",
            Event::ManagerHostFailed { .. } => "manager-host-failed",
            Event::ManagerProgress(_) => "manager-progress",
            Event::ManagerSucceeded { .. } => "manager-succeeded",
            Event::ManagerWait { .. } => "manager-wait",
            Event::ManagerInterrupted { .. } => "manager-interrupted",
        }
    }
}

/// Fan-out publisher. Cloning shares the subscriber list.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(tx);
        rx
    }

    pub fn publish(&self, event: Event) {
        trace!(event = event.name(), "Publishing event");
        // Dropped receivers are pruned here.
        self.subscribers().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// A poisoned lock is recovered; the sender list is still intact.
    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<Event>>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| {
            warn!("Event bus lock was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_fans_out_and_prunes() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let b = bus.subscribe();
        drop(b);

        bus.publish(Event::JobDefined {
            job_id: JobId::from("x"),
        });

        let received = a.try_recv().unwrap();
        assert_eq!(received.name(), "job-defined");
        assert_eq!(bus.subscribers().len(), 1);
    }

    #[test]
    fn test_poisoned_bus_still_delivers() {
        let bus = EventBus::new();
        let poisoner = bus.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.subscribers.lock().unwrap();
            panic!("poison the bus");
        })
        .join();
        assert!(bus.subscribers.is_poisoned());

        let mut rx = bus.subscribe();
        bus.publish(Event::JobDefined {
            job_id: JobId::from("x"),
        });
        assert_eq!(rx.try_recv().unwrap().name(), "job-defined");
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = Event::ManagerJobBlocked {
            job_id: JobId::from("c"),
            blocking_job_id: JobId::from("b"),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], "manager-job-blocked");
        assert_eq!(v["blocking_job_id"], "b");
    }
}
