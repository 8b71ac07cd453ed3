//! Video transcoding through an external `ffmpeg` process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{Converter, EngineKind, Operation, ProgressReporter};
use crate::file::{compressed_name, converted_name, mime_from_name, resized_name, OutputBlob, SelectedFile};

/// stderr lines kept for error messages.
const STDERR_TAIL: usize = 12;

pub struct FfmpegEngine {
    ffmpeg: PathBuf,
    version: String,
    scratch_dir: PathBuf,
    default_crf: u8,
}

impl FfmpegEngine {
    /// Locate and probe ffmpeg. `explicit` wins over a PATH lookup.
    pub async fn load(explicit: Option<&Path>, scratch_dir: &Path, default_crf: u8) -> Result<Self> {
        let ffmpeg = match explicit {
            Some(path) => path.to_path_buf(),
            None => which::which("ffmpeg").context("ffmpeg not found on PATH")?,
        };

        let output = Command::new(&ffmpeg)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", ffmpeg.display()))?;
        if !output.status.success() {
            anyhow::bail!("{} -version exited with {}", ffmpeg.display(), output.status);
        }
        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();

        tokio::fs::create_dir_all(scratch_dir)
            .await
            .with_context(|| format!("Failed to create {}", scratch_dir.display()))?;

        tracing::info!(path = %ffmpeg.display(), version = %version, "Found ffmpeg");
        Ok(Self {
            ffmpeg,
            version,
            scratch_dir: scratch_dir.to_path_buf(),
            default_crf: default_crf.min(51),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

#[async_trait]
impl Converter for FfmpegEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Video
    }

    fn supports_cancel(&self) -> bool {
        true
    }

    async fn run(
        &self,
        operation: &Operation,
        input: &SelectedFile,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<OutputBlob> {
        let source_ext = input.extension().unwrap_or_else(|| "mp4".to_string());
        let (target_ext, file_name, mut args) = match operation {
            Operation::Compress { quality } => {
                let crf = quality.unwrap_or(self.default_crf).min(51);
                (source_ext.clone(), compressed_name(&input.name), codec_args(&source_ext, crf)?)
            }
            Operation::Convert { format } => {
                let ext = format.to_ascii_lowercase();
                let args = codec_args(&ext, self.default_crf)?;
                (ext.clone(), converted_name(input, &ext), args)
            }
            Operation::Resize { max_width, max_height } => {
                let mut args = vec![
                    "-vf".to_string(),
                    format!(
                        "scale={}:{}:force_original_aspect_ratio=decrease,scale=trunc(iw/2)*2:trunc(ih/2)*2",
                        max_width, max_height
                    ),
                ];
                args.extend(codec_args(&source_ext, self.default_crf)?);
                (source_ext.clone(), resized_name(&input.name), args)
            }
            Operation::ExtractPages { .. } => anyhow::bail!("video has no pages"),
        };

        // ffmpeg needs real files on both ends
        let staged;
        let input_path = match input.path() {
            Some(path) => path.to_path_buf(),
            None => {
                let bytes = input.read_all().await?;
                staged = tempfile::Builder::new()
                    .prefix("convertbox-in-")
                    .suffix(&format!(".{}", source_ext))
                    .tempfile_in(&self.scratch_dir)?;
                tokio::fs::write(staged.path(), &bytes).await?;
                staged.path().to_path_buf()
            }
        };
        let output = tempfile::Builder::new()
            .prefix("convertbox-out-")
            .suffix(&format!(".{}", target_ext))
            .tempfile_in(&self.scratch_dir)?;

        let mut command_args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input_path.to_string_lossy().to_string(),
        ];
        command_args.append(&mut args);
        command_args.extend([
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
            output.path().to_string_lossy().to_string(),
        ]);
        tracing::debug!(args = ?command_args, "Spawning ffmpeg");

        let mut child = Command::new(&self.ffmpeg)
            .args(&command_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.ffmpeg.display()))?;

        let stdout = child.stdout.take().context("ffmpeg stdout not captured")?;
        let stderr = child.stderr.take().context("ffmpeg stderr not captured")?;
        let (duration_tx, duration_rx) = watch::channel(None);
        let stderr_task = tokio::spawn(read_stderr(stderr, duration_tx, progress.clone()));
        let progress_task = tokio::spawn(read_progress(stdout, duration_rx, progress.clone()));

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status.context("ffmpeg did not run")?),
        };
        let Some(status) = status else {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill ffmpeg");
            }
            anyhow::bail!("cancelled");
        };

        let tail = join_reader(stderr_task, "stderr").await;
        join_reader(progress_task, "progress").await;

        if !status.success() {
            anyhow::bail!("ffmpeg exited with {}: {}", status, tail.join("\n"));
        }

        let bytes = tokio::fs::read(output.path())
            .await
            .context("Failed to read ffmpeg output")?;
        progress.progress(1.0);

        Ok(OutputBlob::new(bytes, mime_from_name(&file_name), file_name))
    }
}

/// Encoder arguments for a target container.
fn codec_args(ext: &str, crf: u8) -> Result<Vec<String>> {
    let crf = crf.to_string();
    let args: Vec<&str> = match ext {
        "mp4" | "m4v" | "mov" | "mkv" => vec![
            "-c:v", "libx264", "-preset", "medium", "-crf", crf.as_str(), "-c:a", "aac", "-b:a", "128k",
        ],
        "webm" => vec![
            "-c:v", "libvpx-vp9", "-crf", crf.as_str(), "-b:v", "0", "-c:a", "libopus",
        ],
        "avi" => vec!["-c:v", "mpeg4", "-q:v", "5", "-c:a", "mp3"],
        "gif" => vec!["-an", "-vf", "fps=12"],
        "mp3" => vec!["-vn", "-c:a", "libmp3lame", "-q:a", "4"],
        "wav" => vec!["-vn", "-c:a", "pcm_s16le"],
        other => anyhow::bail!("unsupported video container: {}", other),
    };
    Ok(args.into_iter().map(str::to_string).collect())
}

/// Wait for an output reader task. A reader that panicked or was aborted
/// is logged and yields the default.
async fn join_reader<T: Default>(task: tokio::task::JoinHandle<T>, stream: &str) -> T {
    match task.await {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(stream, error = %e, "ffmpeg output reader failed");
            T::default()
        }
    }
}

/// Pick the total duration out of stderr and keep the last few lines.
async fn read_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    duration: watch::Sender<Option<Duration>>,
    progress: ProgressReporter,
) -> Vec<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = Vec::with_capacity(STDERR_TAIL);

    while let Ok(Some(line)) = lines.next_line().await {
        if duration.borrow().is_none() {
            if let Some(total) = parse_duration_line(&line) {
                duration.send_replace(Some(total));
            }
        }
        progress.log(line.clone());
        if tail.len() == STDERR_TAIL {
            tail.remove(0);
        }
        tail.push(line);
    }
    tail
}

/// Turn `-progress pipe:1` key=value lines into fractions.
async fn read_progress<R: AsyncRead + Unpin>(
    stdout: R,
    duration: watch::Receiver<Option<Duration>>,
    progress: ProgressReporter,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let total = *duration.borrow();
        if let Some(fraction) = parse_progress_line(&line, total) {
            progress.progress(fraction);
        }
    }
}

/// `  Duration: 00:01:02.50, start: ...` → 62.5 s
fn parse_duration_line(line: &str) -> Option<Duration> {
    let rest = line.trim_start().strip_prefix("Duration:")?.trim_start();
    let stamp = rest.split(',').next()?.trim();
    parse_timestamp(stamp)
}

/// `HH:MM:SS(.frac)`
fn parse_timestamp(stamp: &str) -> Option<Duration> {
    let mut parts = stamp.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

fn parse_progress_line(line: &str, total: Option<Duration>) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "progress" if value == "end" => Some(1.0),
        // out_time_ms is also in microseconds
        "out_time_us" | "out_time_ms" => {
            let total = total.filter(|t| !t.is_zero())?;
            let micros: i64 = value.parse().ok()?;
            let fraction = micros.max(0) as f64 / total.as_micros() as f64;
            Some(fraction.clamp(0.0, 1.0))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_reader_yields_default() {
        let lines = tokio::spawn(async { vec!["frame=1".to_string()] });
        assert_eq!(join_reader(lines, "stderr").await, vec!["frame=1".to_string()]);

        let aborted = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            vec!["never".to_string()]
        });
        aborted.abort();
        assert!(join_reader(aborted, "stderr").await.is_empty());

        let panicked = tokio::spawn(async { panic!("reader blew up") });
        join_reader::<()>(panicked, "progress").await;
    }

    #[test]
    fn test_duration_line() {
        assert_eq!(
            parse_duration_line("  Duration: 00:01:02.50, start: 0.000000, bitrate: 1205 kb/s"),
            Some(Duration::from_millis(62_500))
        );
        assert_eq!(parse_duration_line("  Duration: N/A, bitrate: N/A"), None);
        assert_eq!(parse_duration_line("Stream #0:0: Video: h264"), None);
    }

    #[test]
    fn test_timestamp_bounds() {
        assert_eq!(parse_timestamp("01:00:00.00"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_timestamp("00:61:00"), None);
        assert_eq!(parse_timestamp("garbage"), None);
    }

    #[test]
    fn test_progress_lines() {
        let total = Some(Duration::from_secs(10));
        assert_eq!(parse_progress_line("out_time_us=4000000", total), Some(0.4));
        assert_eq!(parse_progress_line("out_time_ms=2500000", total), Some(0.25));
        assert_eq!(parse_progress_line("out_time_us=-1", total), Some(0.0));
        assert_eq!(parse_progress_line("out_time_us=99000000", total), Some(1.0));
        assert_eq!(parse_progress_line("progress=end", None), Some(1.0));
        // Without a known duration there is nothing to divide by
        assert_eq!(parse_progress_line("out_time_us=4000000", None), None);
        assert_eq!(parse_progress_line("progress=continue", total), None);
        assert_eq!(parse_progress_line("frame=120", total), None);
    }

    #[test]
    fn test_codec_args() {
        let args = codec_args("webm", 30).unwrap();
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "30"));
        assert!(codec_args("docx", 30).is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_load() {
        let scratch = tempfile::tempdir().unwrap();
        let result = FfmpegEngine::load(
            Some(Path::new("/definitely/not/ffmpeg")),
            scratch.path(),
            28,
        )
        .await;
        let err = result.err().expect("load should fail");
        assert!(format!("{:#}", err).contains("Failed to run"));
    }
}
