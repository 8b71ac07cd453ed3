//! Plain-text export for DOCX and ODT documents.

use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tokio_util::sync::CancellationToken;

use super::{check_cancelled, Converter, EngineKind, Operation, ProgressReporter};
use crate::file::{converted_name, OutputBlob, SelectedFile};

/// XML events between cancellation checks while walking a document body.
const EVENTS_PER_CHECK: usize = 512;

/// Upper bound for one `<text:s text:c="N"/>` run.
const MAX_SPACE_RUN: usize = 1024;

pub struct OfficeEngine;

impl OfficeEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OfficeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Converter for OfficeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Office
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
        match operation {
            Operation::Convert { format } if format.eq_ignore_ascii_case("txt") => {}
            Operation::Convert { format } => anyhow::bail!("office documents convert to txt, not {}", format),
            other => anyhow::bail!("office engine can't {}", other.name()),
        }

        let bytes = input
            .read_all()
            .await
            .with_context(|| format!("Failed to read {}", input.name))?;
        progress.progress(0.1);

        let progress = progress.clone();
        let cancel = cancel.clone();
        let text = tokio::task::spawn_blocking(move || extract_text(&bytes, &progress, &cancel))
            .await
            .context("office worker failed")??;

        Ok(OutputBlob::new(
            text.into_bytes(),
            "text/plain",
            converted_name(input, "txt"),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// Office Open XML (`word/document.xml`)
    Docx,
    /// OpenDocument (`content.xml`)
    Odt,
}

impl Flavor {
    fn body_entry(&self) -> &'static str {
        match self {
            Flavor::Docx => "word/document.xml",
            Flavor::Odt => "content.xml",
        }
    }
}

fn extract_text(bytes: &[u8], progress: &ProgressReporter, cancel: &CancellationToken) -> Result<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("Not a ZIP-based document")?;

    let mut flavor = None;
    for i in 0..archive.len() {
        check_cancelled(cancel)?;
        let entry = archive.by_index(i)?;
        match entry.name() {
            "word/document.xml" => flavor = Some(Flavor::Docx),
            "content.xml" if flavor.is_none() => flavor = Some(Flavor::Odt),
            _ => {}
        }
    }
    let flavor = flavor.context("No document body found (expected DOCX or ODT)")?;
    progress.progress(0.3);
    progress.log(format!("reading {}", flavor.body_entry()));

    let mut xml = String::new();
    archive
        .by_name(flavor.body_entry())?
        .read_to_string(&mut xml)
        .with_context(|| format!("Failed to read {}", flavor.body_entry()))?;
    check_cancelled(cancel)?;
    progress.progress(0.6);

    let text = body_text(&xml, flavor, cancel)?;
    progress.progress(1.0);
    Ok(text)
}

/// Walk the body XML and collect paragraph text.
fn body_text(xml: &str, flavor: Flavor, cancel: &CancellationToken) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut out = String::new();
    // DOCX keeps text in w:t runs, ODT anywhere inside text:p/text:h
    let mut in_text = false;
    let mut paragraph_depth = 0usize;
    let mut events = 0usize;

    loop {
        events += 1;
        if events % EVENTS_PER_CHECK == 0 {
            check_cancelled(cancel)?;
        }

        match reader.read_event().context("Malformed document XML")? {
            Event::Start(e) => match (flavor, e.local_name().as_ref()) {
                (Flavor::Docx, b"t") => in_text = true,
                (Flavor::Odt, b"p" | b"h") => paragraph_depth += 1,
                _ => {}
            },
            Event::Empty(e) => match (flavor, e.local_name().as_ref()) {
                (_, b"tab") => out.push('\t'),
                (Flavor::Docx, b"br" | b"cr") | (Flavor::Odt, b"line-break") => out.push('\n'),
                (Flavor::Docx, b"p") | (Flavor::Odt, b"p" | b"h") => out.push('\n'),
                (Flavor::Odt, b"s") => {
                    let count = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.local_name().as_ref() == b"c")
                        .and_then(|a| std::str::from_utf8(&a.value).ok()?.parse::<usize>().ok())
                        .unwrap_or(1)
                        .min(MAX_SPACE_RUN);
                    out.extend(std::iter::repeat(' ').take(count));
                }
                _ => {}
            },
            Event::End(e) => match (flavor, e.local_name().as_ref()) {
                (Flavor::Docx, b"t") => in_text = false,
                (Flavor::Docx, b"p") => out.push('\n'),
                (Flavor::Odt, b"p" | b"h") => {
                    paragraph_depth = paragraph_depth.saturating_sub(1);
                    out.push('\n');
                }
                _ => {}
            },
            Event::Text(e) => {
                let keep = match flavor {
                    Flavor::Docx => in_text,
                    Flavor::Odt => paragraph_depth > 0,
                };
                if keep {
                    out.push_str(&e.unescape().context("Bad XML text")?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(out)
}
