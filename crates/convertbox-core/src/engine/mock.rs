//! Scriptable in-process engines for tests and demos.
//!
//! `MockBackend` stands in for the native engines the same way a mock
//! embedder stands in for a real model: loads are counted, can be slowed down
//! or made to fail, and converters report progress in fixed steps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    Converter, EngineBackend, EngineKind, MagicSniffer, Operation, ProgressReporter, Sniffer,
    TagReader,
};
use crate::file::{compressed_name, converted_name, mime_from_name, OutputBlob, SelectedFile};

#[derive(Debug, Clone)]
pub struct MockBackend {
    load_delay: Duration,
    steps: u32,
    step_delay: Duration,
    cancelable: bool,
    job_failure: Option<String>,
    tag_delay: Duration,
    tag_failure: bool,
    loads: Arc<Mutex<HashMap<EngineKind, usize>>>,
    failures_left: Arc<Mutex<HashMap<EngineKind, usize>>>,
    completed: Arc<AtomicUsize>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Instant loads, a single-step converter, no failures.
    pub fn new() -> Self {
        Self {
            load_delay: Duration::ZERO,
            steps: 1,
            step_delay: Duration::ZERO,
            cancelable: false,
            job_failure: None,
            tag_delay: Duration::ZERO,
            tag_failure: false,
            loads: Arc::default(),
            failures_left: Arc::default(),
            completed: Arc::default(),
        }
    }

    /// Every engine load takes `delay`.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// The next `times` loads of `kind` fail.
    pub fn fail_loads(self, kind: EngineKind, times: usize) -> Self {
        self.failures_left
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, times);
        self
    }

    /// Converters work in `steps` steps of `delay` each, reporting after every step.
    pub fn with_steps(mut self, steps: u32, delay: Duration) -> Self {
        self.steps = steps.max(1);
        self.step_delay = delay;
        self
    }

    /// Whether converters stop early when their job is cancelled.
    pub fn cancelable(mut self, cancelable: bool) -> Self {
        self.cancelable = cancelable;
        self
    }

    /// Converters run all their steps and then fail with `message`.
    pub fn failing_jobs(mut self, message: impl Into<String>) -> Self {
        self.job_failure = Some(message.into());
        self
    }

    /// Tag reads take `delay`.
    pub fn with_tag_delay(mut self, delay: Duration) -> Self {
        self.tag_delay = delay;
        self
    }

    /// Tag reads fail.
    pub fn failing_tags(mut self) -> Self {
        self.tag_failure = true;
        self
    }

    /// Load attempts made for `kind`, failed ones included.
    pub fn load_count(&self, kind: EngineKind) -> usize {
        self.loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Converter runs that reached the end, whether or not anyone was still waiting.
    pub fn completed_runs(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    async fn load(&self, kind: EngineKind) -> anyhow::Result<()> {
        *self
            .loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default() += 1;

        tokio::time::sleep(self.load_delay).await;

        let mut failures = self
            .failures_left
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(left) = failures.get_mut(&kind).filter(|left| **left > 0) {
            *left -= 1;
            anyhow::bail!("mock {} engine refused to load", kind);
        }
        Ok(())
    }
}

#[async_trait]
impl EngineBackend for MockBackend {
    async fn load_converter(&self, kind: EngineKind) -> anyhow::Result<Arc<dyn Converter>> {
        self.load(kind).await?;
        Ok(Arc::new(MockConverter {
            kind,
            steps: self.steps,
            step_delay: self.step_delay,
            cancelable: self.cancelable,
            failure: self.job_failure.clone(),
            completed: self.completed.clone(),
        }))
    }

    async fn load_sniffer(&self) -> anyhow::Result<Arc<dyn Sniffer>> {
        self.load(EngineKind::Sniffer).await?;
        Ok(Arc::new(MagicSniffer::new()))
    }

    async fn load_tag_reader(&self) -> anyhow::Result<Arc<dyn TagReader>> {
        self.load(EngineKind::Metadata).await?;
        Ok(Arc::new(MockTagReader {
            delay: self.tag_delay,
            fail: self.tag_failure,
        }))
    }
}

struct MockConverter {
    kind: EngineKind,
    steps: u32,
    step_delay: Duration,
    cancelable: bool,
    failure: Option<String>,
    completed: Arc<AtomicUsize>,
}

#[async_trait]
impl Converter for MockConverter {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn supports_cancel(&self) -> bool {
        self.cancelable
    }

    async fn run(
        &self,
        operation: &Operation,
        input: &SelectedFile,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<OutputBlob> {
        progress.log(format!("mock {} {} {}", self.kind, operation.name(), input.name));

        for step in 1..=self.steps {
            if self.cancelable {
                tokio::select! {
                    _ = cancel.cancelled() => anyhow::bail!("cancelled at step {}", step),
                    _ = tokio::time::sleep(self.step_delay) => {}
                }
            } else {
                tokio::time::sleep(self.step_delay).await;
            }
            progress.progress(step as f64 / self.steps as f64);
        }

        if let Some(message) = &self.failure {
            anyhow::bail!("{}", message);
        }

        let bytes = input.read_all().await?;
        self.completed.fetch_add(1, Ordering::SeqCst);

        let file_name = match operation {
            Operation::Convert { format } => converted_name(input, format),
            _ => compressed_name(&input.name),
        };
        Ok(OutputBlob::new(bytes, mime_from_name(&file_name), file_name))
    }
}

struct MockTagReader {
    delay: Duration,
    fail: bool,
}

#[async_trait]
impl TagReader for MockTagReader {
    async fn read_tags(&self, file: &SelectedFile) -> anyhow::Result<serde_json::Value> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            anyhow::bail!("mock metadata engine failed on {}", file.name);
        }
        Ok(serde_json::json!({
            "FileName": file.name,
            "FileSize": file.size,
        }))
    }
}
