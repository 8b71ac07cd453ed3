//! Engines and their lifecycle.
//!
//! ```text
//!   ensure_ready(kind)                       run(job)
//!         │                                     │
//!         ▼                                     ▼
//!   ┌─────────────┐   shared init future   ┌──────────┐   ProgressReporter
//!   │ EngineLoader│ ─────────────────────▶ │ Converter│ ──────────────────▶ ProgressRelay ──▶ active job
//!   └─────────────┘    (one per kind)      └──────────┘   (stamped job id)    (one per runner)
//! ```
//!
//! Engines are black boxes behind three traits: [`Converter`] for anything that
//! turns an input into an output blob, [`Sniffer`] for type detection and
//! [`TagReader`] for metadata. An [`EngineBackend`] knows how to construct
//! each of them; [`Engines`] makes sure that happens at most once per kind.

mod loader;
mod metadata;
pub mod mock;
mod native;
mod office;
mod pdf;
mod progress;
mod raster;
mod registry;
mod sniffer;
mod video;

pub use loader::{EngineLoader, EngineStatus, InitializationState};
pub use metadata::NativeTagReader;
pub use native::NativeBackend;
pub use office::OfficeEngine;
pub use pdf::PdfEngine;
pub use progress::{EngineEvent, ProgressRelay, ProgressReporter};
pub use raster::ImageEngine;
pub use registry::{EngineHandle, Engines};
pub use sniffer::MagicSniffer;
pub use video::FfmpegEngine;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::extract::TypeInfo;
use crate::file::{OutputBlob, SelectedFile};

/// Engine families. Each kind is initialized at most once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Video,
    Image,
    Pdf,
    Office,
    Sniffer,
    Metadata,
}

impl EngineKind {
    pub const ALL: [EngineKind; 6] = [
        EngineKind::Video,
        EngineKind::Image,
        EngineKind::Pdf,
        EngineKind::Office,
        EngineKind::Sniffer,
        EngineKind::Metadata,
    ];

    /// Whether this kind produces output blobs.
    pub fn is_converter(&self) -> bool {
        matches!(
            self,
            EngineKind::Video | EngineKind::Image | EngineKind::Pdf | EngineKind::Office
        )
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Video => write!(f, "video"),
            EngineKind::Image => write!(f, "image"),
            EngineKind::Pdf => write!(f, "pdf"),
            EngineKind::Office => write!(f, "office"),
            EngineKind::Sniffer => write!(f, "sniffer"),
            EngineKind::Metadata => write!(f, "metadata"),
        }
    }
}

/// What a job asks a converter to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Shrink the file. `quality` is engine specific (JPEG quality, video CRF);
    /// `None` uses the configured default.
    Compress { quality: Option<u8> },
    /// Change format; `format` is the target extension (`png`, `mp4`, `txt`, ...).
    Convert { format: String },
    /// Fit within the given box, keeping aspect ratio.
    Resize { max_width: u32, max_height: u32 },
    /// Keep pages `first..=last` (1-based).
    ExtractPages { first: u32, last: u32 },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Compress { .. } => "compress",
            Operation::Convert { .. } => "convert",
            Operation::Resize { .. } => "resize",
            Operation::ExtractPages { .. } => "extract_pages",
        }
    }
}

/// An engine that turns one input into one output blob.
#[async_trait]
pub trait Converter: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Whether `run` observes the cancellation token and stops early.
    ///
    /// Engines without a cancel primitive are left to finish in the
    /// background; their result is discarded.
    fn supports_cancel(&self) -> bool {
        false
    }

    async fn run(
        &self,
        operation: &Operation,
        input: &SelectedFile,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<OutputBlob>;
}

/// Detects file types from leading bytes.
pub trait Sniffer: Send + Sync {
    fn detect(&self, prefix: &[u8]) -> Option<TypeInfo>;
}

/// Extracts tag metadata as a JSON object.
#[async_trait]
pub trait TagReader: Send + Sync {
    async fn read_tags(&self, file: &SelectedFile) -> anyhow::Result<serde_json::Value>;
}

/// Constructs engines. Each method is expensive and is called at most once
/// per successful initialization.
#[async_trait]
pub trait EngineBackend: Send + Sync + 'static {
    async fn load_converter(&self, kind: EngineKind) -> anyhow::Result<Arc<dyn Converter>>;

    async fn load_sniffer(&self) -> anyhow::Result<Arc<dyn Sniffer>>;

    async fn load_tag_reader(&self) -> anyhow::Result<Arc<dyn TagReader>>;
}

/// Bail out of a blocking engine loop when the job was cancelled.
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> anyhow::Result<()> {
    if cancel.is_cancelled() {
        anyhow::bail!("cancelled");
    }
    Ok(())
}
