//! Signature-based file type detection.

use super::Sniffer;
use crate::extract::TypeInfo;

struct Signature {
    offset: usize,
    magic: &'static [u8],
    mime: &'static str,
    description: &'static str,
    extension: &'static str,
}

const fn sig(
    offset: usize,
    magic: &'static [u8],
    mime: &'static str,
    description: &'static str,
    extension: &'static str,
) -> Signature {
    Signature {
        offset,
        magic,
        mime,
        description,
        extension,
    }
}

/// Checked in order; more specific entries first.
const SIGNATURES: &[Signature] = &[
    sig(0, b"\x89PNG\r\n\x1a\n", "image/png", "PNG image", "png"),
    sig(0, b"\xff\xd8\xff", "image/jpeg", "JPEG image", "jpg"),
    sig(0, b"GIF87a", "image/gif", "GIF image", "gif"),
    sig(0, b"GIF89a", "image/gif", "GIF image", "gif"),
    sig(8, b"WEBP", "image/webp", "WebP image", "webp"),
    sig(8, b"AVI ", "video/x-msvideo", "AVI video", "avi"),
    sig(8, b"WAVE", "audio/wav", "WAV audio", "wav"),
    sig(0, b"II*\0", "image/tiff", "TIFF image", "tif"),
    sig(0, b"MM\0*", "image/tiff", "TIFF image", "tif"),
    sig(0, b"BM", "image/bmp", "BMP image", "bmp"),
    sig(0, b"\0\0\x01\0", "image/x-icon", "Windows icon", "ico"),
    sig(0, b"%PDF-", "application/pdf", "PDF document", "pdf"),
    sig(4, b"ftypqt", "video/quicktime", "QuickTime movie", "mov"),
    sig(4, b"ftypM4A", "audio/mp4", "MPEG-4 audio", "m4a"),
    sig(4, b"ftypheic", "image/heic", "HEIC image", "heic"),
    sig(4, b"ftyp", "video/mp4", "MPEG-4 video", "mp4"),
    sig(0, b"ID3", "audio/mpeg", "MP3 audio", "mp3"),
    sig(0, b"\xff\xfb", "audio/mpeg", "MP3 audio", "mp3"),
    sig(0, b"OggS", "audio/ogg", "Ogg media", "ogg"),
    sig(0, b"fLaC", "audio/flac", "FLAC audio", "flac"),
    sig(0, b"\x1f\x8b", "application/gzip", "Gzip archive", "gz"),
    sig(0, b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed", "7-Zip archive", "7z"),
    sig(0, b"Rar!\x1a\x07", "application/vnd.rar", "RAR archive", "rar"),
    sig(0, b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1", "application/x-ole-storage", "Legacy Microsoft Office document", "doc"),
    sig(0, b"{\\rtf", "application/rtf", "Rich Text document", "rtf"),
    sig(0, b"SQLite format 3\0", "application/vnd.sqlite3", "SQLite database", "sqlite"),
    sig(0, b"\x7fELF", "application/x-elf", "ELF executable", "elf"),
    sig(0, b"MZ", "application/vnd.microsoft.portable-executable", "Windows executable", "exe"),
    sig(0, b"\0asm", "application/wasm", "WebAssembly module", "wasm"),
    sig(0, b"<?xml", "application/xml", "XML document", "xml"),
];

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const EBML_MAGIC: &[u8] = b"\x1a\x45\xdf\xa3";

/// Detects types from magic numbers in the first few KiB.
///
/// ZIP and EBML containers are refined by looking further into the prefix
/// (entry names, doctype), so DOCX and WebM aren't reported as ZIP or
/// Matroska.
#[derive(Debug, Default, Clone)]
pub struct MagicSniffer;

impl MagicSniffer {
    pub fn new() -> Self {
        Self
    }
}

impl Sniffer for MagicSniffer {
    fn detect(&self, prefix: &[u8]) -> Option<TypeInfo> {
        if prefix.starts_with(ZIP_MAGIC) {
            return Some(refine_zip(prefix));
        }
        if prefix.starts_with(EBML_MAGIC) {
            return Some(if contains(prefix, b"webm") {
                TypeInfo::new("video/webm", "WebM video", Some("webm"))
            } else {
                TypeInfo::new("video/x-matroska", "Matroska video", Some("mkv"))
            });
        }

        if let Some(found) = SIGNATURES.iter().find(|s| matches_at(prefix, s)) {
            return Some(TypeInfo::new(found.mime, found.description, Some(found.extension)));
        }

        looks_like_text(prefix).then(|| TypeInfo::new("text/plain", "Plain text", Some("txt")))
    }
}

fn matches_at(prefix: &[u8], signature: &Signature) -> bool {
    // Offset 8 entries are RIFF sub-types and need the container header
    if signature.offset == 8 && !prefix.starts_with(b"RIFF") {
        return false;
    }
    prefix
        .get(signature.offset..signature.offset + signature.magic.len())
        .is_some_and(|window| window == signature.magic)
}

fn refine_zip(prefix: &[u8]) -> TypeInfo {
    // ODF stores its mimetype uncompressed as the first entry
    if contains(prefix, b"mimetypeapplication/vnd.oasis.opendocument.text") {
        return TypeInfo::new(
            "application/vnd.oasis.opendocument.text",
            "OpenDocument text",
            Some("odt"),
        );
    }
    if contains(prefix, b"mimetypeapplication/vnd.oasis.opendocument.spreadsheet") {
        return TypeInfo::new(
            "application/vnd.oasis.opendocument.spreadsheet",
            "OpenDocument spreadsheet",
            Some("ods"),
        );
    }
    if contains(prefix, b"word/") {
        return TypeInfo::new(
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "Microsoft Word document",
            Some("docx"),
        );
    }
    if contains(prefix, b"xl/") {
        return TypeInfo::new(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "Microsoft Excel spreadsheet",
            Some("xlsx"),
        );
    }
    if contains(prefix, b"ppt/") {
        return TypeInfo::new(
            "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            "Microsoft PowerPoint presentation",
            Some("pptx"),
        );
    }
    if contains(prefix, b"META-INF/MANIFEST.MF") {
        return TypeInfo::new("application/java-archive", "Java archive", Some("jar"));
    }
    TypeInfo::new("application/zip", "ZIP archive", Some("zip"))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// UTF-8 without control characters other than whitespace.
fn looks_like_text(prefix: &[u8]) -> bool {
    if prefix.is_empty() {
        return false;
    }
    // A multi-byte sequence may be cut off at the end of the prefix
    let text = match std::str::from_utf8(prefix) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => match std::str::from_utf8(&prefix[..e.valid_up_to()]) {
            Ok(text) => text,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    text.chars()
        .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t' | '\x0c'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mime(bytes: &[u8]) -> Option<String> {
        MagicSniffer::new().detect(bytes).map(|t| t.mime)
    }

    #[test]
    fn test_common_signatures() {
        assert_eq!(mime(b"\x89PNG\r\n\x1a\n....").as_deref(), Some("image/png"));
        assert_eq!(mime(b"\xff\xd8\xff\xe0\0\x10JFIF").as_deref(), Some("image/jpeg"));
        assert_eq!(mime(b"%PDF-1.7\n").as_deref(), Some("application/pdf"));
        assert_eq!(mime(b"RIFF\0\0\0\0WEBPVP8 ").as_deref(), Some("image/webp"));
        assert_eq!(mime(b"\0\0\0\x20ftypisom\0\0\x02\0").as_deref(), Some("video/mp4"));
        assert_eq!(mime(b"\0\0\0\x14ftypqt  ").as_deref(), Some("video/quicktime"));
    }

    #[test]
    fn test_riff_subtype_needs_riff_header() {
        assert_eq!(mime(b"XXXX\0\0\0\0WEBPVP8 "), None);
        assert_eq!(mime(b"RIFF\0\0\0\0WAVEfmt ").as_deref(), Some("audio/wav"));
    }

    #[test]
    fn test_ebml_doctype() {
        let mut webm = EBML_MAGIC.to_vec();
        webm.extend_from_slice(b"\x9f\x42\x82\x84webm");
        assert_eq!(mime(&webm).as_deref(), Some("video/webm"));

        let mut mkv = EBML_MAGIC.to_vec();
        mkv.extend_from_slice(b"\x9f\x42\x82\x88matroska");
        assert_eq!(mime(&mkv).as_deref(), Some("video/x-matroska"));
    }

    #[test]
    fn test_zip_refinement() {
        let mut docx = ZIP_MAGIC.to_vec();
        docx.extend_from_slice(&[0u8; 26]);
        docx.extend_from_slice(b"word/document.xml");
        let info = MagicSniffer::new().detect(&docx).unwrap();
        assert_eq!(info.extension.as_deref(), Some("docx"));

        let mut odt = ZIP_MAGIC.to_vec();
        odt.extend_from_slice(&[0u8; 26]);
        odt.extend_from_slice(b"mimetypeapplication/vnd.oasis.opendocument.text");
        assert_eq!(
            mime(&odt).as_deref(),
            Some("application/vnd.oasis.opendocument.text")
        );

        let mut plain = ZIP_MAGIC.to_vec();
        plain.extend_from_slice(b"notes.txt");
        assert_eq!(mime(&plain).as_deref(), Some("application/zip"));
    }

    #[test]
    fn test_text_and_binary_fallback() {
        assert_eq!(mime("héllo wörld\n".as_bytes()).as_deref(), Some("text/plain"));
        // Truncated multi-byte sequence at the end still counts as text
        let mut cut = "naïve".as_bytes().to_vec();
        cut.extend_from_slice(&"é".as_bytes()[..1]);
        assert_eq!(mime(&cut).as_deref(), Some("text/plain"));

        assert_eq!(mime(&[0x13u8; 32]), None);
        assert_eq!(mime(&[]), None);
    }
}
