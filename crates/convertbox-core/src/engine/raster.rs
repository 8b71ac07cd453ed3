//! PNG/JPEG conversion, compression and resizing.

use std::io::Cursor;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use tokio_util::sync::CancellationToken;

use super::{Converter, EngineKind, Operation, ProgressReporter};
use crate::file::{compressed_name, converted_name, resized_name, OutputBlob, SelectedFile};

pub struct ImageEngine {
    default_quality: u8,
}

impl ImageEngine {
    pub fn new(default_quality: u8) -> Self {
        Self {
            default_quality: default_quality.clamp(1, 100),
        }
    }
}

#[async_trait]
impl Converter for ImageEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Image
    }

    async fn run(
        &self,
        operation: &Operation,
        input: &SelectedFile,
        progress: &ProgressReporter,
        _cancel: &CancellationToken,
    ) -> Result<OutputBlob> {
        let plan = Plan::for_operation(operation, input, self.default_quality)?;
        let bytes = input
            .read_all()
            .await
            .with_context(|| format!("Failed to read {}", input.name))?;
        progress.progress(0.1);

        let progress = progress.clone();
        tokio::task::spawn_blocking(move || plan.execute(&bytes, &progress))
            .await
            .context("image worker failed")?
    }
}

/// What to do with the decoded image and how to name the result.
struct Plan {
    resize: Option<(u32, u32)>,
    /// Target format; `None` keeps the input's format
    format: Option<ImageFormat>,
    quality: u8,
    file_name: String,
}

impl Plan {
    fn for_operation(operation: &Operation, input: &SelectedFile, default_quality: u8) -> Result<Self> {
        let plan = match operation {
            Operation::Compress { quality } => Plan {
                resize: None,
                format: None,
                quality: quality.unwrap_or(default_quality).clamp(1, 100),
                file_name: compressed_name(&input.name),
            },
            Operation::Convert { format } => {
                let target = parse_format(format)?;
                Plan {
                    resize: None,
                    format: Some(target),
                    quality: default_quality,
                    file_name: converted_name(input, target.extensions_str()[0]),
                }
            }
            Operation::Resize { max_width, max_height } => {
                if *max_width == 0 || *max_height == 0 {
                    anyhow::bail!("resize bounds must be positive, got {}x{}", max_width, max_height);
                }
                Plan {
                    resize: Some((*max_width, *max_height)),
                    format: None,
                    quality: default_quality,
                    file_name: resized_name(&input.name),
                }
            }
            Operation::ExtractPages { .. } => anyhow::bail!("images have no pages"),
        };
        Ok(plan)
    }

    fn execute(self, bytes: &[u8], progress: &ProgressReporter) -> Result<OutputBlob> {
        let source_format = image::guess_format(bytes).context("unrecognized image data")?;
        let image = image::load_from_memory_with_format(bytes, source_format)
            .context("failed to decode image")?;
        progress.progress(0.4);
        progress.log(format!(
            "decoded {:?} {}x{}",
            source_format,
            image.width(),
            image.height()
        ));

        let image = match self.resize {
            // `resize` keeps the aspect ratio and fits within the bounds
            Some((w, h)) if image.width() > w || image.height() > h => {
                image.resize(w, h, FilterType::Lanczos3)
            }
            _ => image,
        };
        progress.progress(0.7);

        let target = match self.format {
            Some(format) => format,
            None => writable(source_format)?,
        };
        let encoded = encode(&image, target, self.quality)?;
        progress.progress(1.0);

        Ok(OutputBlob::new(encoded, target.to_mime_type(), self.file_name))
    }
}

fn parse_format(format: &str) -> Result<ImageFormat> {
    match format.to_ascii_lowercase().as_str() {
        "png" => Ok(ImageFormat::Png),
        "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
        other => anyhow::bail!("unsupported image format: {}", other),
    }
}

fn writable(format: ImageFormat) -> Result<ImageFormat> {
    match format {
        ImageFormat::Png | ImageFormat::Jpeg => Ok(format),
        other => anyhow::bail!("can't encode {:?} images", other),
    }
}

fn encode(image: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
        }
        ImageFormat::Png => {
            image.write_with_encoder(PngEncoder::new_with_quality(
                &mut out,
                CompressionType::Best,
                PngFilter::Adaptive,
            ))?;
        }
        other => anyhow::bail!("can't encode {:?} images", other),
    }
    Ok(out.into_inner())
}
