//! Per-tool selection and derived state.
//!
//! Every tool area owns a [`ToolSession`]: the selected files, the extraction
//! results derived from them, and (for tools with an engine) one [`JobRunner`].
//! Sessions share engines but no mutable state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::engine::{EngineKind, Engines, Operation};
use crate::error::{JobError, Result};
use crate::extract::{ExtractionPipeline, ExtractionState, ExtractionStep, StepState};
use crate::file::{FileInfo, SelectedFile};
use crate::jobs::{JobOutcome, JobRunner, JobSnapshot};

/// Feature areas of the toolbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolDomain {
    Images,
    Video,
    Pdf,
    Office,
    Utilities,
}

impl ToolDomain {
    pub const ALL: [ToolDomain; 5] = [
        ToolDomain::Images,
        ToolDomain::Video,
        ToolDomain::Pdf,
        ToolDomain::Office,
        ToolDomain::Utilities,
    ];

    /// The converter behind this tool. Utilities only inspect files.
    pub fn engine(&self) -> Option<EngineKind> {
        match self {
            ToolDomain::Images => Some(EngineKind::Image),
            ToolDomain::Video => Some(EngineKind::Video),
            ToolDomain::Pdf => Some(EngineKind::Pdf),
            ToolDomain::Office => Some(EngineKind::Office),
            ToolDomain::Utilities => None,
        }
    }
}

impl std::fmt::Display for ToolDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolDomain::Images => write!(f, "images"),
            ToolDomain::Video => write!(f, "video"),
            ToolDomain::Pdf => write!(f, "pdf"),
            ToolDomain::Office => write!(f, "office"),
            ToolDomain::Utilities => write!(f, "utilities"),
        }
    }
}

impl std::str::FromStr for ToolDomain {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "images" | "image" => Ok(ToolDomain::Images),
            "video" => Ok(ToolDomain::Video),
            "pdf" => Ok(ToolDomain::Pdf),
            "office" => Ok(ToolDomain::Office),
            "utilities" | "utils" => Ok(ToolDomain::Utilities),
            other => Err(format!("unknown tool: {}", other)),
        }
    }
}

/// What the shell renders for a session.
///
/// `extractions[i]` belongs to `files[i]`. `generation` changes on every
/// selection or clear.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub generation: u64,
    pub files: Vec<FileInfo>,
    pub extractions: Vec<ExtractionState>,
}

/// Handle on the latest run of one extraction step for one file.
struct StepRun {
    attempt: u64,
    cancel: CancellationToken,
}

/// Identifies a step run when its results come back.
#[derive(Debug, Clone, Copy)]
struct StepTicket {
    generation: u64,
    index: usize,
    step: ExtractionStep,
    attempt: u64,
}

struct Selection {
    generation: u64,
    files: Vec<SelectedFile>,
    /// Parent of every step token for this selection
    cancel: CancellationToken,
    runs: HashMap<(usize, ExtractionStep), StepRun>,
    next_attempt: u64,
}

impl Selection {
    fn new() -> Self {
        Self {
            generation: 0,
            files: Vec::new(),
            cancel: CancellationToken::new(),
            runs: HashMap::new(),
            next_attempt: 0,
        }
    }

    fn replace(&mut self, files: Vec<SelectedFile>) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.runs.clear();
        self.generation += 1;
        self.files = files;
    }

    /// Start a new run of `step` for file `index`, cancelling the previous one.
    fn start_run(&mut self, index: usize, step: ExtractionStep) -> (StepTicket, CancellationToken) {
        self.next_attempt += 1;
        let cancel = self.cancel.child_token();
        let previous = self.runs.insert(
            (index, step),
            StepRun {
                attempt: self.next_attempt,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let ticket = StepTicket {
            generation: self.generation,
            index,
            step,
            attempt: self.next_attempt,
        };
        (ticket, cancel)
    }

    fn is_current(&self, ticket: &StepTicket) -> bool {
        self.generation == ticket.generation
            && self
                .runs
                .get(&(ticket.index, ticket.step))
                .is_some_and(|run| run.attempt == ticket.attempt)
    }
}

pub struct ToolSession {
    domain: ToolDomain,
    pipeline: ExtractionPipeline,
    runner: Option<JobRunner>,
    selection: Arc<Mutex<Selection>>,
    state: Arc<watch::Sender<SessionState>>,
}

impl ToolSession {
    pub fn new(domain: ToolDomain, engines: Arc<Engines>, settings: &Settings) -> Self {
        let runner = domain
            .engine()
            .map(|kind| JobRunner::new(kind, engines.clone(), settings.slow_job_threshold()));
        let (state, _) = watch::channel(SessionState::default());

        Self {
            domain,
            pipeline: ExtractionPipeline::new(engines, settings),
            runner,
            selection: Arc::new(Mutex::new(Selection::new())),
            state: Arc::new(state),
        }
    }

    pub fn domain(&self) -> ToolDomain {
        self.domain
    }

    /// Replace the selection and start extracting every file.
    ///
    /// Returns immediately; results arrive through [`subscribe`](Self::subscribe).
    /// Work still running for the previous selection is cancelled and its
    /// results are never applied.
    pub fn select_files(&self, files: Vec<SelectedFile>) -> u64 {
        self.replace_selection(files, true)
    }

    /// Replace the selection without starting extraction.
    ///
    /// Every step stays `NotComputed` until
    /// [`retry_extraction`](Self::retry_extraction) asks for it. For callers
    /// that only want to run a job on the files.
    pub fn select_files_without_extraction(&self, files: Vec<SelectedFile>) -> u64 {
        self.replace_selection(files, false)
    }

    fn replace_selection(&self, files: Vec<SelectedFile>, extract: bool) -> u64 {
        let mut selection = self.selection.lock().unwrap_or_else(PoisonError::into_inner);
        selection.replace(files);

        let generation = selection.generation;
        self.state.send_replace(SessionState {
            generation,
            files: selection.files.iter().map(SelectedFile::info).collect(),
            extractions: vec![ExtractionState::default(); selection.files.len()],
        });
        tracing::info!(
            tool = %self.domain,
            generation,
            files = selection.files.len(),
            extract,
            "Selection changed"
        );

        if extract {
            for index in 0..selection.files.len() {
                for step in ExtractionStep::ALL {
                    self.spawn_step(&mut selection, index, step);
                }
            }
        }
        generation
    }

    /// Drop the selection, its extraction work and any running job.
    pub fn clear_files(&self) {
        {
            let mut selection = self.selection.lock().unwrap_or_else(PoisonError::into_inner);
            selection.replace(Vec::new());

            self.state.send_replace(SessionState {
                generation: selection.generation,
                ..Default::default()
            });
        }
        self.cancel_processing();
        tracing::debug!(tool = %self.domain, "Selection cleared");
    }

    /// Run one extraction step again for every selected file.
    ///
    /// A run of the same step still in flight is cancelled and its result
    /// dropped. Returns how many files were restarted.
    pub fn retry_extraction(&self, step: ExtractionStep) -> usize {
        let mut selection = self.selection.lock().unwrap_or_else(PoisonError::into_inner);
        let files = selection.files.len();
        for index in 0..files {
            self.spawn_step(&mut selection, index, step);
        }
        tracing::debug!(tool = %self.domain, %step, files, "Retrying extraction");
        files
    }

    /// Cancel one extraction step for every selected file.
    ///
    /// Files where the step was in flight go back to `NotComputed`; finished
    /// results are kept. Returns how many runs were cancelled.
    pub fn cancel_extraction(&self, step: ExtractionStep) -> usize {
        let mut selection = self.selection.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = selection.generation;
        let mut cancelled = 0;
        for index in 0..selection.files.len() {
            let Some(run) = selection.runs.remove(&(index, step)) else {
                continue;
            };
            run.cancel.cancel();
            apply(&self.state, generation, index, |e| {
                if e.is_step_loading(step) {
                    e.set_not_computed(step);
                    cancelled += 1;
                }
            });
        }
        tracing::debug!(tool = %self.domain, %step, cancelled, "Cancelled extraction");
        cancelled
    }

    fn spawn_step(&self, selection: &mut Selection, index: usize, step: ExtractionStep) {
        let Some(file) = selection.files.get(index).cloned() else {
            return;
        };
        let (ticket, cancel) = selection.start_run(index, step);
        apply(&self.state, ticket.generation, index, |e| e.set_loading(step));

        let pipeline = self.pipeline.clone();
        let runs = self.selection.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let applied = match step {
                ExtractionStep::Type => match pipeline.sniff(&file, &cancel).await {
                    Some(info) => apply_run(&runs, &state, &ticket, |e| e.type_info = StepState::Ready(info)),
                    None => false,
                },
                ExtractionStep::Tags => match pipeline.read_tags(&file, &cancel).await {
                    Some(tags) => apply_run(&runs, &state, &ticket, |e| e.tags = StepState::Ready(tags)),
                    None => false,
                },
                ExtractionStep::Hashes => {
                    let on_progress = {
                        let runs = runs.clone();
                        let state = state.clone();
                        move |p: f64| {
                            apply_run(&runs, &state, &ticket, |e| e.hash_progress = p);
                        }
                    };
                    match pipeline.hash(&file, &cancel, on_progress).await {
                        Some(hashes) => {
                            apply_run(&runs, &state, &ticket, |e| e.hashes = StepState::Ready(hashes))
                        }
                        None => false,
                    }
                }
            };

            if cancel.is_cancelled() {
                apply_run(&runs, &state, &ticket, |e| e.set_not_computed(step));
            } else if !applied {
                tracing::debug!(
                    file = %file.name,
                    %step,
                    generation = ticket.generation,
                    attempt = ticket.attempt,
                    "Discarded stale extraction result"
                );
            }
        });
    }

    /// Run the tool's engine on the first selected file.
    ///
    /// A job already running in this session is cancelled first.
    pub async fn start_job(&self, operation: Operation) -> Result<JobOutcome> {
        let runner = self.runner.as_ref().ok_or_else(|| JobError::Unsupported {
            tool: self.domain.to_string(),
        })?;
        let input = {
            let selection = self.selection.lock().unwrap_or_else(PoisonError::into_inner);
            selection.files.first().cloned().ok_or(JobError::NoInput)?
        };
        Ok(runner.run(operation, input).await)
    }

    /// Cancel the running job, if any.
    pub fn cancel_processing(&self) -> bool {
        self.runner.as_ref().is_some_and(|runner| runner.cancel())
    }

    pub fn is_processing(&self) -> bool {
        self.runner.as_ref().is_some_and(JobRunner::is_processing)
    }

    /// Latest job snapshot. `None` for tools without an engine.
    pub fn progress(&self) -> Option<JobSnapshot> {
        self.runner.as_ref().map(JobRunner::snapshot)
    }

    pub fn subscribe_progress(&self) -> Option<watch::Receiver<JobSnapshot>> {
        self.runner.as_ref().map(JobRunner::subscribe)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn selected_files(&self) -> Vec<SelectedFile> {
        self.selection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .files
            .clone()
    }

    pub fn extraction(&self, index: usize) -> Option<ExtractionState> {
        self.state.borrow().extractions.get(index).cloned()
    }
}

impl Drop for ToolSession {
    fn drop(&mut self) {
        self.selection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel
            .cancel();
    }
}

/// Apply a step result only while its run is the latest one for that step.
fn apply_run(
    selection: &Mutex<Selection>,
    state: &watch::Sender<SessionState>,
    ticket: &StepTicket,
    f: impl FnOnce(&mut ExtractionState),
) -> bool {
    let selection = selection.lock().unwrap_or_else(PoisonError::into_inner);
    if !selection.is_current(ticket) {
        return false;
    }
    apply(state, ticket.generation, ticket.index, f)
}

/// Update one file's extraction state if `generation` is still current.
fn apply(
    state: &watch::Sender<SessionState>,
    generation: u64,
    index: usize,
    f: impl FnOnce(&mut ExtractionState),
) -> bool {
    state.send_if_modified(|s| {
        if s.generation != generation {
            return false;
        }
        match s.extractions.get_mut(index) {
            Some(extraction) => {
                f(extraction);
                true
            }
            None => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::mock::MockBackend;
    use crate::extract::Digest;
    use crate::jobs::JobPhase;

    fn session(domain: ToolDomain, backend: MockBackend) -> Arc<ToolSession> {
        let engines = Arc::new(Engines::new(Arc::new(backend)));
        Arc::new(ToolSession::new(domain, engines, &Settings::default()))
    }

    async fn wait_complete(session: &ToolSession, generation: u64) -> SessionState {
        let mut rx = session.subscribe();
        let state = rx
            .wait_for(|s| s.generation == generation && s.extractions.iter().all(|e| e.is_complete()))
            .await
            .unwrap()
            .clone();
        state
    }

    #[tokio::test]
    async fn test_select_runs_all_steps() {
        let session = session(ToolDomain::Utilities, MockBackend::new());
        let generation = session.select_files(vec![SelectedFile::from_bytes(
            "hello.txt",
            b"hello world\n".to_vec(),
            None,
        )]);

        let state = wait_complete(&session, generation).await;
        let extraction = &state.extractions[0];
        assert_eq!(extraction.type_info.ready().unwrap().mime, "text/plain");
        assert_eq!(
            extraction.tags.ready().unwrap().get("FileName").as_str(),
            Some("hello.txt")
        );
        assert!(extraction.hashes.ready().unwrap().is_complete());
        assert_eq!(extraction.hash_progress, 1.0);
        assert_eq!(state.files[0].name, "hello.txt");
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_selection_discards_stale_results() {
        let session = session(
            ToolDomain::Utilities,
            MockBackend::new().with_tag_delay(Duration::from_secs(5)),
        );
        session.select_files(vec![SelectedFile::from_bytes("first.txt", b"one".to_vec(), None)]);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let second = session.select_files(vec![SelectedFile::from_bytes("second.txt", b"two".to_vec(), None)]);
        let state = wait_complete(&session, second).await;

        assert_eq!(state.files.len(), 1);
        assert_eq!(
            state.extractions[0].tags.ready().unwrap().get("FileName").as_str(),
            Some("second.txt")
        );

        // Let the first selection's work run past its delay
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(session.state(), state);
    }

    #[tokio::test]
    async fn test_clear_resets_state() {
        let session = session(ToolDomain::Images, MockBackend::new());
        session.select_files(vec![SelectedFile::from_bytes("a.png", vec![1, 2, 3], None)]);
        session.clear_files();

        let state = session.state();
        assert_eq!(state.generation, 2);
        assert!(state.files.is_empty());
        assert!(state.extractions.is_empty());
        assert!(session.selected_files().is_empty());
        assert!(session.extraction(0).is_none());
    }

    #[tokio::test]
    async fn test_retry_single_step() {
        let session = session(ToolDomain::Utilities, MockBackend::new());
        let generation = session.select_files(vec![SelectedFile::from_bytes("x.bin", b"abc".to_vec(), None)]);
        wait_complete(&session, generation).await;

        assert_eq!(session.retry_extraction(ExtractionStep::Hashes), 1);
        let state = wait_complete(&session, generation).await;
        let hashes = state.extractions[0].hashes.ready().unwrap();
        assert_eq!(
            hashes.sha256,
            Digest::Hex("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_supersedes_step_in_flight() {
        let session = session(
            ToolDomain::Utilities,
            MockBackend::new().with_tag_delay(Duration::from_secs(5)),
        );
        let generation = session.select_files(vec![SelectedFile::from_bytes("a.txt", b"a".to_vec(), None)]);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(session.retry_extraction(ExtractionStep::Tags), 1);
        // The first run would have finished at 5s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let extraction = session.extraction(0).unwrap();
        assert!(extraction.tags.is_loading());

        let state = wait_complete(&session, generation).await;
        assert_eq!(
            state.extractions[0].tags.ready().unwrap().get("FileName").as_str(),
            Some("a.txt")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_one_step_keeps_the_others() {
        let session = session(
            ToolDomain::Utilities,
            MockBackend::new().with_tag_delay(Duration::from_secs(5)),
        );
        let generation = session.select_files(vec![SelectedFile::from_bytes("a.txt", b"abc".to_vec(), None)]);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(session.cancel_extraction(ExtractionStep::Tags), 1);
        let mut rx = session.subscribe();
        let state = rx
            .wait_for(|s| {
                s.generation == generation
                    && s.extractions[0].type_info.ready().is_some()
                    && s.extractions[0].hashes.ready().is_some()
            })
            .await
            .unwrap()
            .clone();
        assert_eq!(state.extractions[0].tags, StepState::NotComputed);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(session.extraction(0).unwrap().tags, StepState::NotComputed);
        // Finished steps are not touched
        assert_eq!(session.cancel_extraction(ExtractionStep::Hashes), 0);
        assert!(session.extraction(0).unwrap().hashes.ready().is_some());

        session.retry_extraction(ExtractionStep::Tags);
        let state = wait_complete(&session, generation).await;
        assert!(state.extractions[0].tags.ready().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_without_extraction_runs_jobs_only() {
        let session = session(
            ToolDomain::Images,
            MockBackend::new().with_steps(2, Duration::from_millis(10)),
        );
        let generation =
            session.select_files_without_extraction(vec![SelectedFile::from_bytes("a.png", vec![7u8; 16], None)]);

        let outcome = session
            .start_job(Operation::Compress { quality: None })
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Succeeded(_)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let state = session.state();
        assert_eq!(state.generation, generation);
        assert_eq!(state.extractions, vec![ExtractionState::default()]);
    }

    #[tokio::test]
    async fn test_start_job_needs_input_and_engine() {
        let images = session(ToolDomain::Images, MockBackend::new());
        let err = images
            .start_job(Operation::Compress { quality: None })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::ToolboxError::Job(JobError::NoInput)));

        let utilities = session(ToolDomain::Utilities, MockBackend::new());
        utilities.select_files(vec![SelectedFile::from_bytes("a.txt", b"a".to_vec(), None)]);
        let err = utilities
            .start_job(Operation::Compress { quality: None })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::ToolboxError::Job(JobError::Unsupported { .. })));
        assert!(utilities.progress().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_running_job() {
        let session = session(
            ToolDomain::Video,
            MockBackend::new().with_steps(10, Duration::from_millis(100)),
        );
        session.select_files(vec![SelectedFile::from_bytes("clip.mp4", vec![0u8; 32], None)]);

        let job = tokio::spawn({
            let session = session.clone();
            async move { session.start_job(Operation::Compress { quality: None }).await }
        });
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(session.is_processing());

        session.clear_files();
        let outcome = job.await.unwrap().unwrap();
        assert!(outcome.is_cancelled());
        assert!(!session.is_processing());
        assert_eq!(session.progress().unwrap().phase, JobPhase::Cancelled);
    }

    #[test]
    fn test_domain_parsing() {
        assert_eq!("Images".parse::<ToolDomain>().unwrap(), ToolDomain::Images);
        assert_eq!("utils".parse::<ToolDomain>().unwrap(), ToolDomain::Utilities);
        assert!("audio".parse::<ToolDomain>().is_err());
        assert_eq!(ToolDomain::Pdf.engine(), Some(EngineKind::Pdf));
        assert_eq!(ToolDomain::Utilities.engine(), None);
    }
}
