//! Runs one conversion at a time for a tool session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::{JobId, JobOutcome, JobPhase, JobSnapshot};
use crate::engine::{EngineEvent, EngineKind, Engines, Operation, ProgressRelay};
use crate::error::JobError;
use crate::file::SelectedFile;

/// How often elapsed/remaining time and the slow flag are refreshed.
const CLOCK_TICK: Duration = Duration::from_millis(250);

struct ActiveJob {
    id: JobId,
    cancel: CancellationToken,
    started: Instant,
}

/// Owns the single active job of one session.
///
/// Starting a job cancels whatever was running. Progress, timing and the
/// terminal state are published through a watch channel; results from a job
/// that is no longer active are discarded.
pub struct JobRunner {
    kind: EngineKind,
    engines: Arc<Engines>,
    slow_after: Duration,
    active: Mutex<Option<ActiveJob>>,
    snapshot: Arc<watch::Sender<JobSnapshot>>,
    /// Engine events for this runner's jobs only
    relay: Arc<ProgressRelay>,
}

impl JobRunner {
    pub fn new(kind: EngineKind, engines: Arc<Engines>, slow_after: Duration) -> Self {
        let (snapshot, _) = watch::channel(JobSnapshot::idle(kind));
        Self {
            kind,
            engines,
            slow_after,
            active: Mutex::new(None),
            snapshot: Arc::new(snapshot),
            relay: Arc::new(ProgressRelay::new(kind)),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_processing(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Cancel the active job, if any. Its snapshot turns `Cancelled` right away.
    pub fn cancel(&self) -> bool {
        let mut active = self.lock_active();
        self.cancel_locked(&mut active)
    }

    /// Run `operation` on `input` to completion, cancellation or failure.
    ///
    /// Dropping the returned future cancels the job.
    pub async fn run(&self, operation: Operation, input: SelectedFile) -> JobOutcome {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let started = Instant::now();

        {
            let mut active = self.lock_active();
            self.cancel_locked(&mut active);
            *active = Some(ActiveJob {
                id,
                cancel: cancel.clone(),
                started,
            });
            self.snapshot.send_replace(JobSnapshot::preparing(self.kind, id));
        }

        tracing::info!(
            job = %id,
            engine = %self.kind,
            op = operation.name(),
            file = %input.name,
            size = input.size,
            "Job started"
        );

        let _guard = JobGuard { runner: self, id };

        let clock_done = CancellationToken::new();
        let _stop_clock = clock_done.clone().drop_guard();
        tokio::spawn(run_clock(
            self.snapshot.clone(),
            id,
            started,
            self.slow_after,
            clock_done,
        ));

        let converter = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.finish(id, JobOutcome::Cancelled),
            ready = self.engines.converter(self.kind) => match ready {
                Ok(converter) => converter,
                Err(e) => return self.finish(id, JobOutcome::Failed(e.into())),
            },
        };

        let (tx, mut events) = mpsc::unbounded_channel();
        self.relay.attach(id, tx);
        let reporter = self.relay.reporter(id);

        self.update(id, |s| {
            s.phase = JobPhase::Running;
            s.record_progress(0.0, started.elapsed());
        });

        if !converter.supports_cancel() {
            tracing::debug!(engine = %self.kind, "Engine can't be interrupted; a cancelled run finishes in the background");
        }

        // The engine runs detached so a cancelled job returns immediately
        let engine_cancel = cancel.child_token();
        let mut task = tokio::spawn(async move {
            converter
                .run(&operation, &input, &reporter, &engine_cancel)
                .await
        });

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break JobOutcome::Cancelled,
                joined = &mut task => break match joined {
                    Ok(Ok(blob)) => JobOutcome::Succeeded(blob),
                    Ok(Err(_)) if cancel.is_cancelled() => JobOutcome::Cancelled,
                    Ok(Err(e)) => JobOutcome::Failed(JobError::engine(format!("{:#}", e))),
                    Err(e) => JobOutcome::Failed(JobError::engine(format!("engine task failed: {}", e))),
                },
                Some(event) = events.recv() => self.apply_event(id, event, started),
            }
        };

        self.finish(id, outcome)
    }

    fn apply_event(&self, id: JobId, event: EngineEvent, started: Instant) {
        match event {
            EngineEvent::Progress(fraction) => {
                self.update(id, |s| s.record_progress(fraction, started.elapsed()));
            }
            EngineEvent::Log(line) => {
                tracing::debug!(job = %id, engine = %self.kind, "{}", line);
            }
        }
    }

    /// Modify the snapshot if it still belongs to the active job `id`.
    fn update(&self, id: JobId, f: impl FnOnce(&mut JobSnapshot)) {
        self.snapshot.send_if_modified(|s| {
            if s.job_id == Some(id) && s.phase.is_active() {
                f(s);
                true
            } else {
                false
            }
        });
    }

    /// Publish the terminal state of `id` if it is still the active job.
    ///
    /// A job that was superseded or cancelled meanwhile reports `Cancelled`
    /// to its caller and leaves the snapshot alone.
    fn finish(&self, id: JobId, outcome: JobOutcome) -> JobOutcome {
        let mut active = self.lock_active();
        let job = match active.take() {
            Some(job) if job.id == id => job,
            other => {
                *active = other;
                tracing::debug!(job = %id, engine = %self.kind, "Discarding result of inactive job");
                return JobOutcome::Cancelled;
            }
        };

        let elapsed = job.started.elapsed();
        self.snapshot.send_modify(|s| s.finish(&outcome, Some(elapsed)));

        match &outcome {
            JobOutcome::Succeeded(blob) => tracing::info!(
                job = %id,
                engine = %self.kind,
                output = %blob.file_name,
                bytes = blob.len(),
                elapsed_ms = elapsed.as_millis(),
                "Job succeeded"
            ),
            JobOutcome::Failed(e) => tracing::warn!(
                job = %id,
                engine = %self.kind,
                error = %e,
                "Job failed"
            ),
            JobOutcome::Cancelled => tracing::info!(job = %id, engine = %self.kind, "Job cancelled"),
        }

        outcome
    }

    fn cancel_locked(&self, active: &mut Option<ActiveJob>) -> bool {
        let Some(job) = active.take() else {
            return false;
        };
        job.cancel.cancel();
        let elapsed = job.started.elapsed();
        self.snapshot.send_if_modified(|s| {
            if s.job_id == Some(job.id) {
                s.finish(&JobOutcome::Cancelled, Some(elapsed));
                true
            } else {
                false
            }
        });
        tracing::info!(job = %job.id, engine = %self.kind, "Job cancelled");
        true
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cleans up after a `run` future however it ends.
struct JobGuard<'a> {
    runner: &'a JobRunner,
    id: JobId,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.runner.relay.detach(self.id);
        let mut active = self.runner.lock_active();
        if matches!(&*active, Some(job) if job.id == self.id) {
            self.runner.cancel_locked(&mut active);
        }
    }
}

async fn run_clock(
    snapshot: Arc<watch::Sender<JobSnapshot>>,
    id: JobId,
    started: Instant,
    slow_after: Duration,
    done: CancellationToken,
) {
    let mut interval = tokio::time::interval(CLOCK_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = interval.tick() => {
                let elapsed = started.elapsed();
                let mut live = false;
                snapshot.send_if_modified(|s| {
                    live = s.job_id == Some(id) && s.phase.is_active();
                    if live {
                        s.tick(elapsed, slow_after);
                    }
                    live
                });
                if !live {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockBackend;

    fn runner(backend: MockBackend, slow_after: Duration) -> (Arc<JobRunner>, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let engines = Arc::new(Engines::new(backend.clone()));
        (
            Arc::new(JobRunner::new(EngineKind::Image, engines, slow_after)),
            backend,
        )
    }

    fn input() -> SelectedFile {
        SelectedFile::from_bytes("photo.png", vec![0u8; 64], None)
    }

    fn compress() -> Operation {
        Operation::Compress { quality: None }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_job_publishes_output() {
        let (runner, _) = runner(
            MockBackend::new().with_steps(4, Duration::from_millis(100)),
            Duration::from_secs(30),
        );

        let outcome = runner.run(compress(), input()).await;
        let blob = outcome.output().expect("job should succeed");
        assert_eq!(blob.file_name, "compressed_photo.png");

        let snap = runner.snapshot();
        assert_eq!(snap.phase, JobPhase::Succeeded);
        assert_eq!(snap.progress, 1.0);
        assert_eq!(snap.output_name.as_deref(), Some("compressed_photo.png"));
        assert_eq!(snap.remaining, None);
        assert!(!runner.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_job() {
        let (runner, backend) = runner(
            MockBackend::new().with_steps(10, Duration::from_millis(100)),
            Duration::from_secs(30),
        );

        let job = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(compress(), input()).await }
        });

        // Four of ten steps done
        tokio::time::sleep(Duration::from_millis(450)).await;
        let snap = runner.snapshot();
        assert_eq!(snap.phase, JobPhase::Running);
        assert!((snap.progress - 0.4).abs() < 1e-9, "progress {}", snap.progress);
        assert!(snap.remaining.is_some());

        assert!(runner.cancel());
        let snap = runner.snapshot();
        assert_eq!(snap.phase, JobPhase::Cancelled);
        assert_eq!(snap.remaining, None);

        let outcome = job.await.unwrap();
        assert!(outcome.is_cancelled());
        assert!(outcome.output().is_none());

        // Late progress from the detached engine doesn't move the snapshot
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runner.snapshot().phase, JobPhase::Cancelled);
        assert!((runner.snapshot().progress - 0.4).abs() < 1e-9);
        assert_eq!(backend.load_count(EngineKind::Image), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_job_supersedes_running_one() {
        let (runner, _) = runner(
            MockBackend::new().with_steps(5, Duration::from_millis(100)),
            Duration::from_secs(30),
        );

        let first = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(compress(), input()).await }
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        let first_id = runner.snapshot().job_id;

        let second = runner.run(
            Operation::Convert { format: "jpg".into() },
            SelectedFile::from_bytes("other.png", vec![1u8; 8], None),
        );
        let second = second.await;

        assert!(first.await.unwrap().is_cancelled());
        let blob = second.output().expect("second job should succeed");
        assert_eq!(blob.file_name, "converted_other.jpg");

        let snap = runner.snapshot();
        assert_ne!(snap.job_id, first_id);
        assert_eq!(snap.phase, JobPhase::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runners_on_same_engine_keep_own_progress() {
        let backend = Arc::new(MockBackend::new().with_steps(10, Duration::from_millis(100)));
        let engines = Arc::new(Engines::new(backend.clone()));
        let a = Arc::new(JobRunner::new(EngineKind::Image, engines.clone(), Duration::from_secs(30)));
        let b = Arc::new(JobRunner::new(EngineKind::Image, engines, Duration::from_secs(30)));

        let jobs: Vec<_> = [a.clone(), b.clone()]
            .into_iter()
            .map(|runner| tokio::spawn(async move { runner.run(compress(), input()).await }))
            .collect();

        tokio::time::sleep(Duration::from_millis(450)).await;
        for runner in [&a, &b] {
            let snap = runner.snapshot();
            assert_eq!(snap.phase, JobPhase::Running);
            assert!((snap.progress - 0.4).abs() < 1e-9, "progress {}", snap.progress);
        }

        for job in jobs {
            assert!(job.await.unwrap().output().is_some());
        }
        assert_ne!(a.snapshot().job_id, b.snapshot().job_id);
        assert_eq!(backend.load_count(EngineKind::Image), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_flag_raised_and_cleared() {
        let (runner, _) = runner(
            MockBackend::new().with_steps(4, Duration::from_secs(1)),
            Duration::from_secs(2),
        );

        let job = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(compress(), input()).await }
        });

        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert!(runner.snapshot().slow);
        assert_eq!(runner.snapshot().elapsed_display().as_deref(), Some("2s"));

        assert!(job.await.unwrap().output().is_some());
        assert!(!runner.snapshot().slow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_then_retry() {
        let (runner, _) = runner(
            MockBackend::new().fail_loads(EngineKind::Image, 1),
            Duration::from_secs(30),
        );

        let outcome = runner.run(compress(), input()).await;
        match outcome {
            JobOutcome::Failed(JobError::Initialization(e)) => {
                assert_eq!(e.engine, EngineKind::Image)
            }
            other => panic!("expected init failure, got {:?}", other),
        }
        let snap = runner.snapshot();
        assert_eq!(snap.phase, JobPhase::Failed);
        assert!(matches!(
            snap.error,
            Some(crate::error::ErrorReport::InitializationFailed { .. })
        ));

        assert!(runner.run(compress(), input()).await.output().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_error_becomes_failed() {
        let (runner, _) = runner(
            MockBackend::new().failing_jobs("corrupt input"),
            Duration::from_secs(30),
        );

        let outcome = runner.run(compress(), input()).await;
        assert!(matches!(outcome, JobOutcome::Failed(JobError::Engine(ref m)) if m.contains("corrupt input")));
        assert_eq!(runner.snapshot().phase, JobPhase::Failed);
        assert!(!runner.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_run_cancels_job() {
        let (runner, _) = runner(
            MockBackend::new().with_steps(10, Duration::from_millis(100)),
            Duration::from_secs(30),
        );

        let gave_up = tokio::time::timeout(Duration::from_millis(300), runner.run(compress(), input())).await;
        assert!(gave_up.is_err());
        assert!(!runner.is_processing());
        assert_eq!(runner.snapshot().phase, JobPhase::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_without_job_is_noop() {
        let (runner, _) = runner(MockBackend::new(), Duration::from_secs(30));
        assert!(!runner.cancel());
        assert_eq!(runner.snapshot().phase, JobPhase::Idle);
    }
}
