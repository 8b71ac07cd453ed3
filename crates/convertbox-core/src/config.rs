use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bytes handed to the sniffer when detecting a file type.
pub const DEFAULT_SNIFF_PREFIX: usize = 8 * 1024;

/// Hashing reads the whole file into memory; cap it.
pub const DEFAULT_MAX_HASH_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Tag reading parses the whole image or PDF in memory.
pub const DEFAULT_MAX_TAG_BYTES: u64 = 512 * 1024 * 1024;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root data directory (~/.local/share/convertbox)
    pub data_dir: PathBuf,
    /// Scratch space for engines that work on files (ffmpeg)
    pub scratch_dir: PathBuf,
    /// Where finished outputs are written
    pub output_dir: PathBuf,
    /// User settings (JSON)
    pub settings_file: PathBuf,
}

impl Config {
    /// Load configuration or use defaults
    pub fn load_or_default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("convertbox");

        let scratch_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("convertbox")
            .join("scratch");

        Self {
            settings_file: data_dir.join("settings.json"),
            output_dir: PathBuf::from("converted"),
            data_dir,
            scratch_dir,
        }
    }

    /// Use a different output directory
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.scratch_dir)?;
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }
}

/// User-tunable settings, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds before a running job is flagged as slow
    pub slow_job_warning_secs: u64,
    /// Prefix length read for type sniffing
    pub sniff_prefix_bytes: usize,
    /// Explicit ffmpeg binary; looked up on PATH when unset
    pub ffmpeg_path: Option<PathBuf>,
    /// JPEG quality used when compressing images (1-100)
    pub default_image_quality: u8,
    /// CRF used when compressing video (0-51)
    pub default_video_crf: u8,
    /// Files larger than this are not hashed; their digests report unavailable
    pub max_hash_bytes: u64,
    /// Images and PDFs larger than this are not parsed for tags
    pub max_tag_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            slow_job_warning_secs: 30,
            sniff_prefix_bytes: DEFAULT_SNIFF_PREFIX,
            ffmpeg_path: None,
            default_image_quality: 75,
            default_video_crf: 28,
            max_hash_bytes: DEFAULT_MAX_HASH_BYTES,
            max_tag_bytes: DEFAULT_MAX_TAG_BYTES,
        }
    }
}

impl Settings {
    /// Load settings from disk, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read settings");
                return Self::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Invalid settings file, using defaults");
                Self::default()
            }
        }
    }

    /// Write settings to disk.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn slow_job_threshold(&self) -> Duration {
        Duration::from_secs(self.slow_job_warning_secs)
    }
}
