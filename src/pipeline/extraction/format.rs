use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::ExtractionError;

/// Upload formats the extractor accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileFormat {
    Pdf,
    Jpeg,
    Png,
    Tiff,
}

impl FileFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Tiff => "image/tiff",
        }
    }

    pub fn is_image(&self) -> bool {
        !matches!(self, Self::Pdf)
    }

    /// Parse an already-normalized MIME type.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/pdf" => Some(Self::Pdf),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/tiff" | "image/tif" => Some(Self::Tiff),
            _ => None,
        }
    }
}

/// Lowercase and drop parameters: `"Image/PNG; charset=x"` → `"image/png"`.
pub fn normalize_mime(declared: &str) -> String {
    declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Detect the format from magic bytes. Extensions and declared types can lie.
pub fn sniff_format(bytes: &[u8]) -> Option<FileFormat> {
    match bytes {
        [0x25, 0x50, 0x44, 0x46, ..] => Some(FileFormat::Pdf),
        [0xFF, 0xD8, 0xFF, ..] => Some(FileFormat::Jpeg),
        [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(FileFormat::Png),
        [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => Some(FileFormat::Tiff),
        _ => None,
    }
}

/// Re-validate an upload: the declared type must be supported and the
/// content signature must agree with it.
pub fn validate_upload(bytes: &[u8], declared_mime: &str) -> Result<FileFormat, ExtractionError> {
    let mime = normalize_mime(declared_mime);
    let declared = FileFormat::from_mime(&mime)
        .ok_or_else(|| ExtractionError::UnsupportedFormat(mime.clone()))?;

    if bytes.is_empty() {
        return Err(ExtractionError::EmptyFile);
    }

    match sniff_format(bytes) {
        Some(detected) if detected == declared => Ok(declared),
        Some(detected) => Err(ExtractionError::FormatMismatch {
            declared: mime,
            detected: detected.mime_type().to_string(),
        }),
        None => Err(ExtractionError::FormatMismatch {
            declared: mime,
            detected: "unknown signature".to_string(),
        }),
    }
}

static UNSAFE_FILE_CHARS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^\w\s.\-]").ok());

/// Display-safe file name: path components dropped, only word characters,
/// whitespace, `.`, `-` and `_` kept.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned = match UNSAFE_FILE_CHARS.as_ref() {
        Some(re) => re.replace_all(base, "").into_owned(),
        None => base.chars().filter(|c| c.is_alphanumeric()).collect(),
    };
    let cleaned = cleaned.trim().trim_start_matches('.').trim();
    if cleaned.is_empty() {
        "report".to_string()
    } else {
        cleaned.chars().take(255).collect()
    }
}

/// Hex SHA-256 of the content; the stored reference to the raw bytes.
pub fn content_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    #[test]
    fn mime_normalization() {
        assert_eq!(normalize_mime("Image/PNG; charset=binary"), "image/png");
        assert_eq!(normalize_mime("  application/pdf "), "application/pdf");
    }

    #[test]
    fn jpg_alias_accepted() {
        assert_eq!(FileFormat::from_mime("image/jpg"), Some(FileFormat::Jpeg));
        assert_eq!(FileFormat::from_mime("text/plain"), None);
    }

    #[test]
    fn sniffs_known_signatures() {
        assert_eq!(sniff_format(b"%PDF-1.4 ..."), Some(FileFormat::Pdf));
        assert_eq!(sniff_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(FileFormat::Jpeg));
        assert_eq!(sniff_format(PNG_MAGIC), Some(FileFormat::Png));
        assert_eq!(sniff_format(b"II*\0rest"), Some(FileFormat::Tiff));
        assert_eq!(sniff_format(b"MM\0*rest"), Some(FileFormat::Tiff));
        assert_eq!(sniff_format(b"hello"), None);
    }

    #[test]
    fn validate_accepts_matching_upload() {
        assert_eq!(validate_upload(b"%PDF-1.7", "application/pdf").unwrap(), FileFormat::Pdf);
        assert_eq!(validate_upload(PNG_MAGIC, "image/png").unwrap(), FileFormat::Png);
    }

    #[test]
    fn validate_rejects_unsupported_type() {
        let err = validate_upload(b"text", "text/plain").unwrap_err();
        assert!(matches!(err, ExtractionError::UnsupportedFormat(ref m) if m == "text/plain"));
    }

    #[test]
    fn validate_rejects_mismatch() {
        let err = validate_upload(b"%PDF-1.7", "image/png").unwrap_err();
        assert!(matches!(err, ExtractionError::FormatMismatch { .. }));
        assert_eq!(err.user_reason(), "unsupported format");
    }

    #[test]
    fn validate_rejects_empty() {
        let err = validate_upload(b"", "image/jpeg").unwrap_err();
        assert!(matches!(err, ExtractionError::EmptyFile));
    }

    #[test]
    fn file_name_sanitized() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\scans\\blood test (1).pdf"), "blood test 1.pdf");
        assert_eq!(sanitize_file_name("<script>.png"), "script.png");
        assert_eq!(sanitize_file_name("///"), "report");
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            content_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
