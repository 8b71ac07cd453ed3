use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::{
    Converter, EngineBackend, EngineKind, FfmpegEngine, ImageEngine, MagicSniffer, NativeTagReader,
    OfficeEngine, PdfEngine, Sniffer, TagReader,
};
use crate::config::Settings;

/// The engines bundled with convertbox.
pub struct NativeBackend {
    settings: Settings,
    scratch_dir: PathBuf,
}

impl NativeBackend {
    pub fn new(settings: Settings, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            scratch_dir: scratch_dir.into(),
        }
    }
}

#[async_trait]
impl EngineBackend for NativeBackend {
    async fn load_converter(&self, kind: EngineKind) -> Result<Arc<dyn Converter>> {
        let engine: Arc<dyn Converter> = match kind {
            EngineKind::Video => Arc::new(
                FfmpegEngine::load(
                    self.settings.ffmpeg_path.as_deref(),
                    &self.scratch_dir,
                    self.settings.default_video_crf,
                )
                .await?,
            ),
            EngineKind::Image => Arc::new(ImageEngine::new(self.settings.default_image_quality)),
            EngineKind::Pdf => Arc::new(PdfEngine::new()),
            EngineKind::Office => Arc::new(OfficeEngine::new()),
            EngineKind::Sniffer | EngineKind::Metadata => {
                anyhow::bail!("{} is not a converter", kind)
            }
        };
        Ok(engine)
    }

    async fn load_sniffer(&self) -> Result<Arc<dyn Sniffer>> {
        Ok(Arc::new(MagicSniffer::new()))
    }

    async fn load_tag_reader(&self) -> Result<Arc<dyn TagReader>> {
        Ok(Arc::new(NativeTagReader::new(self.settings.max_tag_bytes)))
    }
}
