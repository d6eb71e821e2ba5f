pub mod types;
pub mod format;
pub mod sanitize;
pub mod preprocess;
pub mod pdf;
pub mod pdfium;
pub mod ocr;
pub mod metrics;
pub mod orchestrator;

pub use types::*;
pub use format::*;
pub use sanitize::*;
pub use pdf::*;
pub use ocr::*;
pub use metrics::{MetricVocabulary, VOCABULARY_VERSION};
pub use orchestrator::*;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Declared type {declared} does not match content ({detected})")]
    FormatMismatch { declared: String, detected: String },

    #[error("File is empty")]
    EmptyFile,

    #[error("Corrupt image: {0}")]
    CorruptImage(String),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("PDF is password-protected")]
    PdfEncrypted,

    #[error("PDF rendering failed on page {page}: {reason}")]
    PdfRendering { page: usize, reason: String },

    #[error("No readable text found")]
    NoReadableText,

    #[error("Tesseract OCR initialization failed: {0}")]
    OcrInit(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("OCR support is not available in this build")]
    OcrUnavailable,

    #[error("Tessdata not found at: {0}")]
    TessdataNotFound(PathBuf),

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Extraction worker failed: {0}")]
    Worker(String),
}

impl ExtractionError {
    /// Short reason stored on the failed document and shown to the user.
    /// Never includes library messages or paths.
    pub fn user_reason(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) | Self::FormatMismatch { .. } => "unsupported format",
            Self::EmptyFile => "empty file",
            Self::CorruptImage(_) | Self::ImageProcessing(_) => "corrupt or unreadable image",
            Self::PdfParsing(_) | Self::PdfRendering { .. } => "corrupt or unreadable PDF",
            Self::PdfEncrypted => "password-protected PDF",
            Self::NoReadableText => "no readable text",
            Self::OcrProcessing(_) => "unreadable scan",
            Self::OcrInit(_) | Self::OcrUnavailable | Self::TessdataNotFound(_) => {
                "text recognition unavailable"
            }
            Self::Timeout(_) => "extraction timed out",
            Self::Worker(_) => "extraction failed",
        }
    }
}
