//! PDF compression and page extraction on top of lopdf.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lopdf::Document;
use tokio_util::sync::CancellationToken;

use super::{Converter, EngineKind, Operation, ProgressReporter};
use crate::file::{compressed_name, pages_name, OutputBlob, SelectedFile};

pub struct PdfEngine;

impl PdfEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Converter for PdfEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Pdf
    }

    async fn run(
        &self,
        operation: &Operation,
        input: &SelectedFile,
        progress: &ProgressReporter,
        _cancel: &CancellationToken,
    ) -> Result<OutputBlob> {
        let task = match operation {
            Operation::Compress { .. } => PdfTask::Compress,
            Operation::ExtractPages { first, last } => PdfTask::Pages(*first, *last),
            other => anyhow::bail!("PDF engine can't {}", other.name()),
        };

        let bytes = input
            .read_all()
            .await
            .with_context(|| format!("Failed to read {}", input.name))?;
        progress.progress(0.1);

        let name = input.name.clone();
        let progress = progress.clone();
        tokio::task::spawn_blocking(move || task.execute(&bytes, &name, &progress))
            .await
            .context("PDF worker failed")?
    }
}

enum PdfTask {
    Compress,
    /// 1-based inclusive page range
    Pages(u32, u32),
}

impl PdfTask {
    fn execute(self, bytes: &[u8], name: &str, progress: &ProgressReporter) -> Result<OutputBlob> {
        let mut doc = Document::load_mem(bytes).context("Failed to parse PDF")?;
        let page_count = doc.get_pages().len() as u32;
        progress.progress(0.4);
        progress.log(format!("PDF {} with {} pages", doc.version, page_count));

        let file_name = match self {
            PdfTask::Compress => compressed_name(name),
            PdfTask::Pages(first, last) => {
                if first == 0 || first > last || last > page_count {
                    anyhow::bail!(
                        "page range {}-{} is outside 1-{}",
                        first,
                        last,
                        page_count
                    );
                }
                let drop: Vec<u32> = doc
                    .get_pages()
                    .keys()
                    .copied()
                    .filter(|n| *n < first || *n > last)
                    .collect();
                doc.delete_pages(&drop);
                pages_name(name, first, last)
            }
        };

        let pruned = doc.prune_objects().len();
        let empty = doc.delete_zero_length_streams().len();
        doc.renumber_objects();
        doc.compress();
        progress.progress(0.8);
        tracing::debug!(pruned, empty_streams = empty, "Optimized PDF objects");

        let mut out = Vec::with_capacity(bytes.len());
        doc.save_to(&mut out).context("Failed to write PDF")?;
        progress.progress(1.0);

        Ok(OutputBlob::new(out, "application/pdf", file_name))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::{dictionary, Document, Object, Stream};

    /// A PDF with one page of text per entry.
    pub fn multipage_pdf(page_texts: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        });

        let mut page_ids = Vec::new();
        for text in page_texts {
            let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", text);
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Resources" => resources_id,
                "Contents" => content_id,
            });
            page_ids.push(page_id);
        }

        let kids: Vec<Object> = page_ids.iter().map(|&id| id.into()).collect();
        let pages_id = doc.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => Object::Integer(page_texts.len() as i64),
        });
        for page_id in &page_ids {
            if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(*page_id) {
                dict.set("Parent", pages_id);
            }
        }

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        let info_id = doc.add_object(dictionary! {
            "Title" => Object::string_literal("Quarterly report"),
            "Author" => Object::string_literal("Finance"),
        });
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer).unwrap();
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::multipage_pdf;
    use super::*;

    async fn run(op: Operation, file: &SelectedFile) -> Result<OutputBlob> {
        PdfEngine::new()
            .run(&op, file, &ProgressReporter::detached(), &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_extract_page_range() {
        let file = SelectedFile::from_bytes("report.pdf", multipage_pdf(&["one", "two", "three", "four"]), None);

        let blob = run(Operation::ExtractPages { first: 2, last: 3 }, &file).await.unwrap();
        assert_eq!(blob.file_name, "pages_2-3_report.pdf");

        let doc = Document::load_mem(&blob.bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 2);
        let text = doc.extract_text(&[1]).unwrap();
        assert!(text.contains("two"), "first page text: {:?}", text);
    }

    #[tokio::test]
    async fn test_invalid_range_is_rejected() {
        let file = SelectedFile::from_bytes("report.pdf", multipage_pdf(&["one", "two"]), None);
        assert!(run(Operation::ExtractPages { first: 0, last: 1 }, &file).await.is_err());
        assert!(run(Operation::ExtractPages { first: 2, last: 1 }, &file).await.is_err());
        assert!(run(Operation::ExtractPages { first: 1, last: 3 }, &file).await.is_err());
    }

    #[tokio::test]
    async fn test_compress_keeps_pages() {
        let file = SelectedFile::from_bytes("report.pdf", multipage_pdf(&["a", "b", "c"]), None);
        let blob = run(Operation::Compress { quality: None }, &file).await.unwrap();

        assert_eq!(blob.file_name, "compressed_report.pdf");
        assert_eq!(blob.mime, "application/pdf");
        assert_eq!(Document::load_mem(&blob.bytes).unwrap().get_pages().len(), 3);
    }

    #[tokio::test]
    async fn test_not_a_pdf() {
        let file = SelectedFile::from_bytes("fake.pdf", b"hello".to_vec(), None);
        let err = run(Operation::Compress { quality: None }, &file).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse PDF"));

        assert!(run(Operation::Convert { format: "txt".into() }, &file).await.is_err());
    }
}
