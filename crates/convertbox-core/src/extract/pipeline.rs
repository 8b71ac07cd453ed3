use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::hash::{hash_all, HashTriple};
use super::types::{ExtractionResult, TagMap, TypeInfo};
use crate::config::Settings;
use crate::engine::Engines;
use crate::file::SelectedFile;

/// Derives type info, tag metadata and digests for a selected file.
///
/// Each step absorbs its own failures into a fallback value. A step only
/// returns `None` when it was cancelled.
#[derive(Clone)]
pub struct ExtractionPipeline {
    engines: Arc<Engines>,
    sniff_prefix: usize,
    max_hash_bytes: u64,
}

impl ExtractionPipeline {
    pub fn new(engines: Arc<Engines>, settings: &Settings) -> Self {
        Self {
            engines,
            sniff_prefix: settings.sniff_prefix_bytes,
            max_hash_bytes: settings.max_hash_bytes,
        }
    }

    /// Detect the file type from its leading bytes.
    pub async fn sniff(&self, file: &SelectedFile, cancel: &CancellationToken) -> Option<TypeInfo> {
        cancellable(cancel, async {
            let sniffer = match self.engines.sniffer().await {
                Ok(sniffer) => sniffer,
                Err(e) => {
                    tracing::warn!(file = %file.name, error = %e, "Sniffer unavailable");
                    return TypeInfo::unknown();
                }
            };

            let prefix = match file.read_prefix(self.sniff_prefix).await {
                Ok(prefix) => prefix,
                Err(e) => {
                    tracing::warn!(file = %file.name, error = %e, "Failed to read file prefix");
                    return TypeInfo::unknown();
                }
            };

            let info = sniffer.detect(&prefix).unwrap_or_else(TypeInfo::unknown);
            tracing::debug!(file = %file.name, mime = %info.mime, "Sniffed file type");
            info
        })
        .await
    }

    /// Read tag metadata. Unsupported files and engine failures give an empty map.
    pub async fn read_tags(&self, file: &SelectedFile, cancel: &CancellationToken) -> Option<TagMap> {
        cancellable(cancel, async {
            let reader = match self.engines.tag_reader().await {
                Ok(reader) => reader,
                Err(e) => {
                    tracing::warn!(file = %file.name, error = %e, "Metadata engine unavailable");
                    return TagMap::new();
                }
            };

            match reader.read_tags(file).await {
                Ok(json) => TagMap::from_json(&json),
                Err(e) => {
                    tracing::warn!(file = %file.name, error = %format!("{:#}", e), "Metadata extraction failed");
                    TagMap::new()
                }
            }
        })
        .await
    }

    /// Hash the whole file. Reports 0.25 once read and 1.0 once digested.
    pub async fn hash(
        &self,
        file: &SelectedFile,
        cancel: &CancellationToken,
        on_progress: impl Fn(f64) + Send,
    ) -> Option<HashTriple> {
        cancellable(cancel, async {
            if file.size > self.max_hash_bytes {
                tracing::warn!(
                    file = %file.name,
                    size = file.size,
                    limit = self.max_hash_bytes,
                    "File too large to hash"
                );
                return HashTriple::unavailable();
            }

            let bytes = match file.read_all().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(file = %file.name, error = %e, "Failed to read file for hashing");
                    return HashTriple::unavailable();
                }
            };
            on_progress(0.25);

            let hashes = hash_all(bytes).await;
            on_progress(1.0);
            hashes
        })
        .await
    }

    /// Run all three steps concurrently.
    pub async fn extract(&self, file: &SelectedFile, cancel: &CancellationToken) -> Option<ExtractionResult> {
        let (type_info, tags, hashes) = tokio::join!(
            self.sniff(file, cancel),
            self.read_tags(file, cancel),
            self.hash(file, cancel, |_| {}),
        );

        Some(ExtractionResult {
            type_info: type_info?,
            tags: tags?,
            hashes: hashes?,
        })
    }
}

async fn cancellable<T>(cancel: &CancellationToken, work: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        value = work => Some(value),
    }
}
