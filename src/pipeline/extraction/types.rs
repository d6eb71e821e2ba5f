use serde::Serialize;

use super::ExtractionError;
use crate::models::enums::ExtractionMethod;
use crate::models::MetricMap;

/// Where a page's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageSource {
    /// Embedded text layer of a digital PDF.
    TextLayer,
    /// Recognized from a rasterized page or a photographed report.
    Ocr,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageText {
    pub page_number: usize,
    pub text: String,
    pub source: PageSource,
}

/// Outcome of a successful `extract` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub method: ExtractionMethod,
    pub pages: Vec<PageText>,
    /// Sanitized text of all pages, joined by blank lines.
    pub raw_text: String,
    /// Best-effort; empty when nothing in the vocabulary matched.
    pub metrics: MetricMap,
}

/// Raw OCR result from the engine
#[derive(Debug, Clone)]
pub struct OcrPageResult {
    pub text: String,
    /// Mean confidence in 0.0..=1.0.
    pub confidence: f32,
}

/// OCR engine abstraction (allows mocking for tests)
pub trait OcrEngine: Send + Sync {
    /// Recognize text from PNG bytes.
    fn recognize(&self, png_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError>;
}

/// Embedded-text extraction, one string per page.
pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, pdf_bytes: &[u8]) -> Result<Vec<String>, ExtractionError>;
}

/// Rasterizes PDF pages for OCR.
pub trait PdfPageRenderer: Send + Sync {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError>;

    /// Render a 0-based page to PNG bytes.
    fn render_page(&self, pdf_bytes: &[u8], page_index: usize, dpi: u32)
        -> Result<Vec<u8>, ExtractionError>;
}
