//! Convertbox Core - engine lifecycle and job orchestration
//!
//! This crate contains everything behind the convertbox shell:
//! - Lazy, exactly-once engine initialization (video, image, pdf, office,
//!   type sniffing, metadata)
//! - Job running with progress, time estimates and cancellation
//! - Per-tool sessions holding the current selection
//! - Metadata and hash extraction on selection

pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod file;
pub mod jobs;
pub mod session;

use std::sync::Arc;

pub use config::{Config, Settings};
pub use engine::{EngineBackend, EngineKind, Engines, NativeBackend, Operation};
pub use error::{ErrorReport, InitError, JobError, Result, ToolboxError};
pub use extract::{ExtractionPipeline, ExtractionResult, ExtractionState, ExtractionStep};
pub use file::{OutputBlob, SelectedFile};
pub use jobs::{JobOutcome, JobPhase, JobSnapshot};
pub use session::{SessionState, ToolDomain, ToolSession};

/// Every tool session, sharing one engine registry.
pub struct Toolbox {
    engines: Arc<Engines>,
    settings: Settings,
    images: Arc<ToolSession>,
    video: Arc<ToolSession>,
    pdf: Arc<ToolSession>,
    office: Arc<ToolSession>,
    utilities: Arc<ToolSession>,
}

impl Toolbox {
    pub fn new(engines: Arc<Engines>, settings: Settings) -> Self {
        let session = |domain| Arc::new(ToolSession::new(domain, engines.clone(), &settings));
        Self {
            images: session(ToolDomain::Images),
            video: session(ToolDomain::Video),
            pdf: session(ToolDomain::Pdf),
            office: session(ToolDomain::Office),
            utilities: session(ToolDomain::Utilities),
            engines,
            settings,
        }
    }

    /// Toolbox on the bundled engines, installed as the process-wide registry.
    pub fn native(config: &Config, settings: Settings) -> Self {
        let backend = NativeBackend::new(settings.clone(), &config.scratch_dir);
        let engines = Engines::install(Arc::new(backend));
        Self::new(engines, settings)
    }

    pub fn engines(&self) -> &Arc<Engines> {
        &self.engines
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session(&self, domain: ToolDomain) -> &Arc<ToolSession> {
        match domain {
            ToolDomain::Images => &self.images,
            ToolDomain::Video => &self.video,
            ToolDomain::Pdf => &self.pdf,
            ToolDomain::Office => &self.office,
            ToolDomain::Utilities => &self.utilities,
        }
    }
}
