//! Process-wide engine registry.

use std::sync::{Arc, OnceLock};

use super::loader::{EngineLoader, EngineStatus};
use super::{Converter, EngineBackend, EngineKind, Sniffer, TagReader};
use crate::error::InitError;

static GLOBAL: OnceLock<Arc<Engines>> = OnceLock::new();

/// A ready engine of any kind.
#[derive(Clone)]
pub enum EngineHandle {
    Converter(Arc<dyn Converter>),
    Sniffer(Arc<dyn Sniffer>),
    TagReader(Arc<dyn TagReader>),
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineHandle::Converter(c) => write!(f, "EngineHandle::Converter({})", c.kind()),
            EngineHandle::Sniffer(_) => write!(f, "EngineHandle::Sniffer"),
            EngineHandle::TagReader(_) => write!(f, "EngineHandle::TagReader"),
        }
    }
}

/// One loader per engine kind, all backed by the same [`EngineBackend`].
pub struct Engines {
    backend: Arc<dyn EngineBackend>,
    video: EngineLoader<dyn Converter>,
    image: EngineLoader<dyn Converter>,
    pdf: EngineLoader<dyn Converter>,
    office: EngineLoader<dyn Converter>,
    sniffer: EngineLoader<dyn Sniffer>,
    metadata: EngineLoader<dyn TagReader>,
}

impl Engines {
    pub fn new(backend: Arc<dyn EngineBackend>) -> Self {
        Self {
            backend,
            video: EngineLoader::new(EngineKind::Video),
            image: EngineLoader::new(EngineKind::Image),
            pdf: EngineLoader::new(EngineKind::Pdf),
            office: EngineLoader::new(EngineKind::Office),
            sniffer: EngineLoader::new(EngineKind::Sniffer),
            metadata: EngineLoader::new(EngineKind::Metadata),
        }
    }

    /// Install the process-wide registry.
    ///
    /// The first call wins; later calls return the already installed registry
    /// and drop their backend.
    pub fn install(backend: Arc<dyn EngineBackend>) -> Arc<Engines> {
        GLOBAL
            .get_or_init(|| {
                tracing::debug!("Installing process-wide engine registry");
                Arc::new(Engines::new(backend))
            })
            .clone()
    }

    /// The process-wide registry, if installed.
    pub fn global() -> Option<Arc<Engines>> {
        GLOBAL.get().cloned()
    }

    fn converter_loader(&self, kind: EngineKind) -> Option<&EngineLoader<dyn Converter>> {
        match kind {
            EngineKind::Video => Some(&self.video),
            EngineKind::Image => Some(&self.image),
            EngineKind::Pdf => Some(&self.pdf),
            EngineKind::Office => Some(&self.office),
            EngineKind::Sniffer | EngineKind::Metadata => None,
        }
    }

    /// A conversion engine, initializing it on first use.
    pub async fn converter(&self, kind: EngineKind) -> Result<Arc<dyn Converter>, InitError> {
        let loader = self
            .converter_loader(kind)
            .ok_or_else(|| InitError::new(kind, "not a conversion engine"))?;
        let backend = self.backend.clone();
        loader
            .ensure_ready(move || async move { backend.load_converter(kind).await })
            .await
    }

    pub async fn sniffer(&self) -> Result<Arc<dyn Sniffer>, InitError> {
        let backend = self.backend.clone();
        self.sniffer
            .ensure_ready(move || async move { backend.load_sniffer().await })
            .await
    }

    pub async fn tag_reader(&self) -> Result<Arc<dyn TagReader>, InitError> {
        let backend = self.backend.clone();
        self.metadata
            .ensure_ready(move || async move { backend.load_tag_reader().await })
            .await
    }

    /// Make sure the engine for `kind` is initialized and return it.
    pub async fn ensure_ready(&self, kind: EngineKind) -> Result<EngineHandle, InitError> {
        match kind {
            EngineKind::Sniffer => self.sniffer().await.map(EngineHandle::Sniffer),
            EngineKind::Metadata => self.tag_reader().await.map(EngineHandle::TagReader),
            _ => self.converter(kind).await.map(EngineHandle::Converter),
        }
    }

    pub fn status(&self, kind: EngineKind) -> EngineStatus {
        match kind {
            EngineKind::Sniffer => self.sniffer.status(),
            EngineKind::Metadata => self.metadata.status(),
            _ => self.converter_loader(kind).map(|l| l.status()).unwrap_or(EngineStatus::Uninitialized),
        }
    }

    /// Initialization attempts started for `kind`.
    pub fn attempts(&self, kind: EngineKind) -> u64 {
        match kind {
            EngineKind::Sniffer => self.sniffer.attempts(),
            EngineKind::Metadata => self.metadata.attempts(),
            _ => self.converter_loader(kind).map(|l| l.attempts()).unwrap_or(0),
        }
    }

    /// Initialize several engines concurrently, e.g. ahead of first use.
    pub async fn warm_up(&self, kinds: &[EngineKind]) -> Vec<(EngineKind, Result<(), InitError>)> {
        futures::future::join_all(kinds.iter().map(|&kind| async move {
            (kind, self.ensure_ready(kind).await.map(|_| ()))
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockBackend;

    #[tokio::test]
    async fn test_non_converter_kind_is_rejected() {
        let engines = Engines::new(Arc::new(MockBackend::new()));
        let err = engines.converter(EngineKind::Sniffer).await.err().unwrap();
        assert_eq!(err.engine, EngineKind::Sniffer);
        assert_eq!(engines.attempts(EngineKind::Sniffer), 0);
    }

    #[tokio::test]
    async fn test_ensure_ready_returns_matching_handle() {
        let engines = Engines::new(Arc::new(MockBackend::new()));

        let handle = engines.ensure_ready(EngineKind::Metadata).await.unwrap();
        assert!(matches!(handle, EngineHandle::TagReader(_)));

        let handle = engines.ensure_ready(EngineKind::Image).await.unwrap();
        assert!(matches!(handle, EngineHandle::Converter(ref c) if c.kind() == EngineKind::Image));
        assert_eq!(engines.status(EngineKind::Image), EngineStatus::Ready);
        assert_eq!(engines.status(EngineKind::Video), EngineStatus::Uninitialized);
    }

    #[tokio::test]
    async fn test_warm_up_reports_each_kind() {
        let backend = Arc::new(MockBackend::new().fail_loads(EngineKind::Video, 1));
        let engines = Engines::new(backend.clone());

        let results = engines
            .warm_up(&[EngineKind::Video, EngineKind::Pdf, EngineKind::Sniffer])
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());
        assert!(results[2].1.is_ok());
        assert_eq!(backend.load_count(EngineKind::Pdf), 1);
    }
}
