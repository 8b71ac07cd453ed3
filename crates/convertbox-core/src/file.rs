//! Selected inputs and produced outputs.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncReadExt;

/// Where a selected file's bytes live.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// Bytes already in memory (drag-and-drop, tests)
    Memory(Bytes),
    /// File on disk, read on demand
    Path(PathBuf),
}

/// A user-chosen input.
///
/// `mime` is the advisory type reported at selection time; the sniffer
/// decides what the bytes actually are.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub name: String,
    pub size: u64,
    pub mime: String,
    source: FileSource,
}

/// Serializable view of a selection for the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mime: String,
}

impl SelectedFile {
    /// Wrap in-memory bytes. Without an explicit type, one is guessed from the name.
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>, mime: Option<&str>) -> Self {
        let name = name.into();
        let bytes = bytes.into();
        let mime = mime
            .map(str::to_string)
            .unwrap_or_else(|| mime_from_name(&name).to_string());
        Self {
            size: bytes.len() as u64,
            name,
            mime,
            source: FileSource::Memory(bytes),
        }
    }

    /// Select a file on disk.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());

        Ok(Self {
            mime: mime_from_name(&name).to_string(),
            size: metadata.len(),
            name,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn source(&self) -> &FileSource {
        &self.source
    }

    /// Path on disk, if this selection is file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(p) => Some(p),
            FileSource::Memory(_) => None,
        }
    }

    /// Read at most `len` bytes from the start of the file.
    pub async fn read_prefix(&self, len: usize) -> std::io::Result<Bytes> {
        match &self.source {
            FileSource::Memory(bytes) => Ok(bytes.slice(..len.min(bytes.len()))),
            FileSource::Path(path) => {
                let file = tokio::fs::File::open(path).await?;
                let mut buf = Vec::with_capacity(len.min(self.size as usize));
                file.take(len as u64).read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Read the whole file into memory.
    pub async fn read_all(&self) -> std::io::Result<Bytes> {
        match &self.source {
            FileSource::Memory(bytes) => Ok(bytes.clone()),
            FileSource::Path(path) => tokio::fs::read(path).await.map(Bytes::from),
        }
    }

    /// File name without its final extension.
    pub fn stem(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }

    /// Lowercased final extension, if any.
    pub fn extension(&self) -> Option<String> {
        match self.name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                Some(ext.to_ascii_lowercase())
            }
            _ => None,
        }
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            name: self.name.clone(),
            size: self.size,
            mime: self.mime.clone(),
        }
    }
}

/// Guess a MIME type from a file name's extension.
pub fn mime_from_name(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "odt" => "application/vnd.oasis.opendocument.text",
        "txt" => "text/plain",
        "json" => "application/json",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Result of a successful job, ready to be saved.
#[derive(Debug, Clone)]
pub struct OutputBlob {
    pub bytes: Bytes,
    pub mime: String,
    pub file_name: String,
}

impl OutputBlob {
    pub fn new(bytes: impl Into<Bytes>, mime: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime: mime.into(),
            file_name: file_name.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Write the blob into `dir` under its derived name.
    ///
    /// Bytes go to a temporary file first and are renamed into place, so a
    /// reader never sees a half-written output.
    pub async fn save_into(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let dir = dir.to_path_buf();
        let bytes = self.bytes.clone();
        let target = dir.join(sanitize_file_name(&self.file_name));

        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.flush()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok::<_, std::io::Error>(target)
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

/// `compressed_<name>`
pub fn compressed_name(original: &str) -> String {
    format!("compressed_{}", original)
}

/// `converted_<stem>.<ext>`
pub fn converted_name(file: &SelectedFile, extension: &str) -> String {
    format!("converted_{}.{}", file.stem(), extension)
}

/// `resized_<name>`
pub fn resized_name(original: &str) -> String {
    format!("resized_{}", original)
}

/// `pages_<first>-<last>_<name>`
pub fn pages_name(original: &str, first: u32, last: u32) -> String {
    format!("pages_{}-{}_{}", first, last, original)
}

/// Strip path separators so an output can't escape its directory.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "output".to_string()
    } else {
        cleaned
    }
}
