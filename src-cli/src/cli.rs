use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Subcommand, ValueEnum};
use serde_json::json;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use convertbox_core::extract::HashAlgorithm;
use convertbox_core::{
    EngineKind, ExtractionPipeline, ExtractionState, JobOutcome, JobSnapshot, Operation,
    SelectedFile, Settings, ToolDomain, Toolbox,
};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Detect type, read metadata and hash files
    Inspect {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print MD5, SHA-1 and SHA-256 of a file
    Hash { file: PathBuf },
    /// Run a tool (images, video, pdf, office) on a file
    Convert {
        tool: ToolDomain,
        file: PathBuf,
        #[command(flatten)]
        job: JobArgs,
        /// Output directory (default ./converted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show engine status
    Engines {
        /// Initialize every engine first
        #[arg(long)]
        warm: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Compress,
    Convert,
    Resize,
    Pages,
}

#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    #[arg(long, value_enum, default_value_t = OpKind::Compress)]
    pub op: OpKind,
    /// Target extension for --op convert
    #[arg(long)]
    pub format: Option<String>,
    /// JPEG quality or video CRF for --op compress
    #[arg(long)]
    pub quality: Option<u8>,
    #[arg(long)]
    pub width: Option<u32>,
    #[arg(long)]
    pub height: Option<u32>,
    /// Page range for --op pages, e.g. `2-5` or `3`
    #[arg(long)]
    pub pages: Option<String>,
    /// ffmpeg binary to use instead of the one on PATH
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,
    /// Seconds before warning that the job is slow
    #[arg(long)]
    pub slow_after: Option<u64>,
}

impl JobArgs {
    pub fn operation(&self) -> anyhow::Result<Operation> {
        let op = match self.op {
            OpKind::Compress => Operation::Compress {
                quality: self.quality,
            },
            OpKind::Convert => Operation::Convert {
                format: self.format.clone().context("--op convert needs --format")?,
            },
            OpKind::Resize => {
                let (max_width, max_height) = match (self.width, self.height) {
                    (Some(w), Some(h)) => (w, h),
                    (Some(w), None) => (w, u32::MAX),
                    (None, Some(h)) => (u32::MAX, h),
                    (None, None) => anyhow::bail!("--op resize needs --width and/or --height"),
                };
                Operation::Resize {
                    max_width,
                    max_height,
                }
            }
            OpKind::Pages => {
                let range = self.pages.as_deref().context("--op pages needs --pages")?;
                let (first, last) = parse_page_range(range)?;
                Operation::ExtractPages { first, last }
            }
        };
        Ok(op)
    }

    /// Flags win over the settings file.
    pub fn apply_overrides(&self, mut settings: Settings) -> Settings {
        if let Some(ffmpeg) = &self.ffmpeg {
            settings.ffmpeg_path = Some(ffmpeg.clone());
        }
        if let Some(secs) = self.slow_after {
            settings.slow_job_warning_secs = secs;
        }
        settings
    }
}

/// `2-5` or a single page `3`.
pub fn parse_page_range(range: &str) -> anyhow::Result<(u32, u32)> {
    let (first, last) = match range.split_once('-') {
        Some((first, last)) => (first.trim(), last.trim()),
        None => (range.trim(), range.trim()),
    };
    let first: u32 = first
        .parse()
        .with_context(|| format!("Invalid page number: {:?}", first))?;
    let last: u32 = last
        .parse()
        .with_context(|| format!("Invalid page number: {:?}", last))?;
    if first == 0 || first > last {
        anyhow::bail!("Invalid page range: {}", range);
    }
    Ok((first, last))
}

async fn select(paths: &[PathBuf]) -> anyhow::Result<Vec<SelectedFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let file = SelectedFile::from_path(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        files.push(file);
    }
    Ok(files)
}

/// Run the extraction pipeline on each file and print the results as JSON.
pub async fn inspect(toolbox: &Toolbox, paths: &[PathBuf]) -> anyhow::Result<()> {
    let files = select(paths).await?;
    let session = toolbox.session(ToolDomain::Utilities);

    let generation = session.select_files(files);
    let mut updates = session.subscribe();
    let state = updates
        .wait_for(|s| s.generation == generation && s.extractions.iter().all(ExtractionState::is_complete))
        .await
        .context("Session closed before extraction finished")?
        .clone();

    let report: Vec<_> = state
        .files
        .iter()
        .zip(&state.extractions)
        .map(|(file, extraction)| json!({ "file": file, "extraction": extraction }))
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn hash(toolbox: &Toolbox, path: &Path) -> anyhow::Result<()> {
    let file = SelectedFile::from_path(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let pipeline = ExtractionPipeline::new(toolbox.engines().clone(), toolbox.settings());

    let cancel = CancellationToken::new();
    let interrupt = spawn_interrupt(cancel.clone());

    let hashes = pipeline
        .hash(&file, &cancel, |p| tracing::debug!(progress = p, "Hashing"))
        .await;
    interrupt.abort();
    let hashes = hashes.context("Cancelled")?;
    for algorithm in HashAlgorithm::ALL {
        println!("{:<8} {}", algorithm.to_string(), hashes.get(algorithm));
    }
    Ok(())
}

/// Cancel `token` on Ctrl+C.
fn spawn_interrupt(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

/// Run one job with live progress on stderr. Ctrl+C cancels it.
pub async fn convert(
    toolbox: &Toolbox,
    tool: ToolDomain,
    path: &Path,
    job: &JobArgs,
    out_dir: &Path,
) -> anyhow::Result<PathBuf> {
    let operation = job.operation()?;
    let session = toolbox.session(tool);
    let file = SelectedFile::from_path(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    tracing::info!(%tool, file = %file.name, op = operation.name(), "Starting job");
    session.select_files_without_extraction(vec![file]);

    let display = session.subscribe_progress().map(|rx| tokio::spawn(render_progress(rx)));

    let run = session.start_job(operation);
    tokio::pin!(run);
    let outcome = tokio::select! {
        outcome = &mut run => outcome?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            tracing::info!("Cancelling");
            session.cancel_processing();
            run.await?
        }
    };
    session.clear_files();

    if let Some(display) = display {
        display.abort();
    }
    eprintln!();

    match outcome {
        JobOutcome::Succeeded(blob) => {
            let saved = blob
                .save_into(out_dir)
                .await
                .with_context(|| format!("Failed to save {}", blob.file_name))?;
            tracing::info!(path = %saved.display(), bytes = blob.len(), "Saved output");
            Ok(saved)
        }
        JobOutcome::Cancelled => anyhow::bail!("Cancelled"),
        JobOutcome::Failed(err) => Err(err.into()),
    }
}

async fn render_progress(rx: watch::Receiver<JobSnapshot>) {
    let mut updates = WatchStream::new(rx);
    let mut warned = false;
    while let Some(snapshot) = updates.next().await {
        if !snapshot.phase.is_active() {
            continue;
        }
        if snapshot.slow && !warned {
            warned = true;
            eprintln!();
            tracing::warn!("This is taking longer than usual");
        }
        eprint!("\r{:<60}", progress_line(&snapshot));
    }
}

pub fn progress_line(snapshot: &JobSnapshot) -> String {
    let mut line = format!(
        "[{:>3}%] {}",
        (snapshot.progress * 100.0).round() as u32,
        snapshot.engine
    );
    if let Some(elapsed) = snapshot.elapsed_display() {
        line.push_str(&format!("  elapsed {}", elapsed));
    }
    if let Some(remaining) = snapshot.remaining_display() {
        line.push_str(&format!("  ~{} left", remaining));
    }
    line
}

/// Print every engine's state, optionally initializing them all first.
pub async fn engines(toolbox: &Toolbox, warm: bool) -> anyhow::Result<()> {
    let engines = toolbox.engines();
    if warm {
        for (kind, result) in engines.warm_up(&EngineKind::ALL).await {
            if let Err(e) = result {
                tracing::warn!(engine = %kind, error = %e, "Engine failed to initialize");
            }
        }
    }

    let report: Vec<_> = EngineKind::ALL
        .iter()
        .map(|&kind| {
            json!({
                "engine": kind,
                "state": engines.status(kind),
                "attempts": engines.attempts(kind),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clap::Parser;
    use convertbox_core::{Engines, JobPhase, NativeBackend};

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Command,
    }

    fn toolbox(scratch: &Path) -> Toolbox {
        let settings = Settings::default();
        let backend = NativeBackend::new(settings.clone(), scratch);
        Toolbox::new(Arc::new(Engines::new(Arc::new(backend))), settings)
    }

    fn job(args: &[&str]) -> JobArgs {
        let mut argv = vec!["convertbox", "convert", "pdf", "in.pdf"];
        argv.extend_from_slice(args);
        match TestCli::parse_from(argv).command {
            Command::Convert { job, .. } => job,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_page_ranges() {
        assert_eq!(parse_page_range("2-5").unwrap(), (2, 5));
        assert_eq!(parse_page_range(" 3 ").unwrap(), (3, 3));
        assert!(parse_page_range("0-2").is_err());
        assert!(parse_page_range("5-2").is_err());
        assert!(parse_page_range("a-b").is_err());
    }

    #[test]
    fn test_job_args_to_operation() {
        assert_eq!(
            job(&[]).operation().unwrap(),
            Operation::Compress { quality: None }
        );
        assert_eq!(
            job(&["--op", "pages", "--pages", "2-3"]).operation().unwrap(),
            Operation::ExtractPages { first: 2, last: 3 }
        );
        assert_eq!(
            job(&["--op", "resize", "--width", "800"]).operation().unwrap(),
            Operation::Resize {
                max_width: 800,
                max_height: u32::MAX
            }
        );
        assert!(job(&["--op", "convert"]).operation().is_err());
    }

    #[test]
    fn test_flags_override_settings() {
        let settings = job(&["--ffmpeg", "/opt/ffmpeg", "--slow-after", "5"])
            .apply_overrides(Settings::default());
        assert_eq!(settings.ffmpeg_path, Some(PathBuf::from("/opt/ffmpeg")));
        assert_eq!(settings.slow_job_warning_secs, 5);
    }

    #[test]
    fn test_progress_line() {
        let mut snapshot = JobSnapshot::idle(EngineKind::Video);
        snapshot.phase = JobPhase::Running;
        snapshot.progress = 0.4;
        snapshot.elapsed = Some(std::time::Duration::from_secs(4));
        snapshot.remaining = Some(std::time::Duration::from_secs(6));
        assert_eq!(progress_line(&snapshot), "[ 40%] video  elapsed 4s  ~6s left");
    }

    #[tokio::test]
    async fn test_convert_office_to_text_fails_on_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("notes.docx");
        std::fs::write(&input, "not a zip").unwrap();

        let toolbox = toolbox(dir.path());
        let err = convert(
            &toolbox,
            ToolDomain::Office,
            &input,
            &job(&["--op", "convert", "--format", "txt"]),
            &dir.path().join("out"),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("ZIP"), "{}", err);
    }

    #[tokio::test]
    async fn test_utilities_cannot_convert() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.txt");
        std::fs::write(&input, "hello").unwrap();

        let toolbox = toolbox(dir.path());
        let err = convert(&toolbox, ToolDomain::Utilities, &input, &job(&[]), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no conversion engine"));
    }

    #[tokio::test]
    async fn test_inspect_and_hash_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.txt");
        std::fs::write(&input, "hello").unwrap();

        let toolbox = toolbox(dir.path());
        inspect(&toolbox, &[input.clone()]).await.unwrap();
        hash(&toolbox, &input).await.unwrap();
        engines(&toolbox, false).await.unwrap();
    }
}
