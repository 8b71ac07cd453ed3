//! Tag metadata for images and PDFs.

use std::io::Cursor;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegDecoder;
use image::codecs::png::PngDecoder;
use image::{ImageDecoder, ImageFormat};
use lopdf::{Document, Object};
use serde_json::{json, Map, Value};

use super::TagReader;
use crate::config::DEFAULT_MAX_TAG_BYTES;
use crate::file::SelectedFile;

/// Enough leading bytes to recognize the PDF, PNG and JPEG signatures.
const SIGNATURE_BYTES: usize = 16;

/// Reads header-level tags without decoding pixel data or page content.
///
/// Output mirrors the usual metadata tool layout: flat `Key: value` pairs with
/// the PDF Info dictionary nested under `Info`. Unsupported types give `{}`
/// after reading only their signature.
#[derive(Debug, Clone)]
pub struct NativeTagReader {
    /// Largest image or PDF parsed in memory
    max_bytes: u64,
}

impl NativeTagReader {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl Default for NativeTagReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TAG_BYTES)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagSource {
    Pdf,
    Image(ImageFormat),
}

impl TagSource {
    fn detect(prefix: &[u8]) -> Option<Self> {
        if prefix.starts_with(b"%PDF-") {
            return Some(TagSource::Pdf);
        }
        match image::guess_format(prefix) {
            Ok(format @ (ImageFormat::Png | ImageFormat::Jpeg)) => Some(TagSource::Image(format)),
            _ => None,
        }
    }
}

#[async_trait]
impl TagReader for NativeTagReader {
    async fn read_tags(&self, file: &SelectedFile) -> Result<Value> {
        let prefix = file
            .read_prefix(SIGNATURE_BYTES)
            .await
            .with_context(|| format!("Failed to read {}", file.name))?;
        let Some(source) = TagSource::detect(&prefix) else {
            return Ok(Value::Object(Map::new()));
        };
        if file.size > self.max_bytes {
            anyhow::bail!(
                "{} is {} bytes, over the {} byte limit for reading tags",
                file.name,
                file.size,
                self.max_bytes
            );
        }

        let bytes = file
            .read_all()
            .await
            .with_context(|| format!("Failed to read {}", file.name))?;

        tokio::task::spawn_blocking(move || match source {
            TagSource::Pdf => pdf_tags(&bytes),
            TagSource::Image(format) => image_tags(&bytes, format),
        })
        .await
        .context("metadata worker failed")?
    }
}

fn image_tags(bytes: &[u8], format: ImageFormat) -> Result<Value> {
    let (dimensions, color) = match format {
        ImageFormat::Png => {
            let decoder = PngDecoder::new(Cursor::new(bytes)).context("Invalid PNG header")?;
            (decoder.dimensions(), decoder.color_type())
        }
        ImageFormat::Jpeg => {
            let decoder = JpegDecoder::new(Cursor::new(bytes)).context("Invalid JPEG header")?;
            (decoder.dimensions(), decoder.color_type())
        }
        other => anyhow::bail!("no tag reader for {:?}", other),
    };

    Ok(json!({
        "FileType": format!("{:?}", format).to_uppercase(),
        "MIMEType": format.to_mime_type(),
        "ImageWidth": dimensions.0,
        "ImageHeight": dimensions.1,
        "ColorType": format!("{:?}", color),
        "HasAlpha": color.has_alpha(),
    }))
}

fn pdf_tags(bytes: &[u8]) -> Result<Value> {
    let doc = Document::load_mem(bytes).context("Failed to parse PDF")?;

    let mut tags = json!({
        "FileType": "PDF",
        "MIMEType": "application/pdf",
        "PDFVersion": doc.version,
        "PageCount": doc.get_pages().len(),
        "Encrypted": doc.trailer.get(b"Encrypt").is_ok(),
    });

    let info = doc
        .trailer
        .get(b"Info")
        .and_then(Object::as_reference)
        .and_then(|id| doc.get_dictionary(id));
    if let Ok(info) = info {
        let mut fields = Map::new();
        for (key, value) in info.iter() {
            if let Some(value) = pdf_value(value) {
                fields.insert(String::from_utf8_lossy(key).into_owned(), value);
            }
        }
        if !fields.is_empty() {
            tags["Info"] = Value::Object(fields);
        }
    }

    Ok(tags)
}

fn pdf_value(object: &Object) -> Option<Value> {
    match object {
        Object::String(bytes, _) => Some(Value::String(decode_pdf_text(bytes))),
        Object::Name(name) => Some(Value::String(String::from_utf8_lossy(name).into_owned())),
        Object::Integer(n) => Some(json!(n)),
        Object::Real(n) => Some(json!(n)),
        Object::Boolean(b) => Some(Value::Bool(*b)),
        _ => None,
    }
}

/// PDF text strings are UTF-16BE with a BOM or PDFDocEncoding (close enough to Latin-1).
fn decode_pdf_text(bytes: &[u8]) -> String {
    match bytes.strip_prefix(&[0xfe, 0xff]) {
        Some(utf16) => {
            let units: Vec<u16> = utf16
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        None => bytes.iter().map(|&b| b as char).collect(),
    }
}
