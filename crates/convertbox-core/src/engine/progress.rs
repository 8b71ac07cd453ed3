//! Per-runner progress relay.
//!
//! Each job runner owns a relay and points it at whichever of its jobs is
//! active. Runners on the same engine kind never see each other's events. Every report carries the id of the job
//! that produced it, so a stale engine run can't move a newer job's progress.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::EngineKind;
use crate::jobs::JobId;

/// Something an engine said while running a job.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Fraction complete in [0, 1]
    Progress(f64),
    /// Free-form diagnostic line
    Log(String),
}

struct Target {
    job: JobId,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

pub struct ProgressRelay {
    kind: EngineKind,
    target: Mutex<Option<Target>>,
}

impl ProgressRelay {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            target: Mutex::new(None),
        }
    }

    /// Route events for `job` to `tx`, replacing any previous target.
    pub fn attach(&self, job: JobId, tx: mpsc::UnboundedSender<EngineEvent>) {
        let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = target.replace(Target { job, tx }) {
            tracing::debug!(engine = %self.kind, previous = %previous.job, job = %job, "Progress relay redirected");
        }
    }

    /// Stop routing events for `job`. A no-op when another job took over.
    pub fn detach(&self, job: JobId) -> bool {
        let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        match target.as_ref() {
            Some(t) if t.job == job => {
                *target = None;
                true
            }
            _ => false,
        }
    }

    /// The job currently receiving events, if any.
    pub fn current(&self) -> Option<JobId> {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.job)
    }

    fn deliver(&self, job: JobId, event: EngineEvent) -> bool {
        let target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        match target.as_ref() {
            Some(t) if t.job == job => t.tx.send(event).is_ok(),
            _ => {
                tracing::trace!(engine = %self.kind, job = %job, "Dropped event from inactive job");
                false
            }
        }
    }

    /// A reporter bound to `job`.
    pub fn reporter(self: &Arc<Self>, job: JobId) -> ProgressReporter {
        ProgressReporter {
            relay: Some(self.clone()),
            job,
        }
    }
}

/// Handle an engine uses to report progress for one job.
#[derive(Clone)]
pub struct ProgressReporter {
    relay: Option<Arc<ProgressRelay>>,
    job: JobId,
}

impl ProgressReporter {
    /// A reporter that goes nowhere, for calling engines directly.
    pub fn detached() -> Self {
        Self {
            relay: None,
            job: Uuid::nil(),
        }
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn progress(&self, fraction: f64) {
        if let Some(relay) = &self.relay {
            relay.deliver(self.job, EngineEvent::Progress(fraction));
        }
    }

    pub fn log(&self, line: impl Into<String>) {
        if let Some(relay) = &self.relay {
            relay.deliver(self.job, EngineEvent::Log(line.into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_attached_job() {
        let relay = Arc::new(ProgressRelay::new(EngineKind::Image));
        let job = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay.attach(job, tx);

        relay.reporter(job).progress(0.5);
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::Progress(0.5));
    }

    #[test]
    fn test_stale_reporter_is_ignored() {
        let relay = Arc::new(ProgressRelay::new(EngineKind::Video));
        let old_job = Uuid::new_v4();
        let new_job = Uuid::new_v4();

        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        relay.attach(old_job, old_tx);
        let stale = relay.reporter(old_job);

        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        relay.attach(new_job, new_tx);

        stale.progress(0.9);
        stale.log("late line");
        assert!(new_rx.try_recv().is_err());

        // Old job finishing must not unhook the new one
        assert!(!relay.detach(old_job));
        assert_eq!(relay.current(), Some(new_job));
        assert!(relay.detach(new_job));
        assert_eq!(relay.current(), None);
    }

    #[test]
    fn test_detached_reporter_is_silent() {
        let reporter = ProgressReporter::detached();
        reporter.progress(1.0);
        reporter.log("nothing listens");
        assert!(reporter.job().is_nil());
    }
}
