use std::sync::Arc;

use super::format::{validate_upload, FileFormat};
use super::metrics::MetricVocabulary;
use super::preprocess::prepare_for_ocr;
use super::sanitize::{meaningful_chars, sanitize_extracted_text};
use super::types::{
    ExtractionResult, OcrEngine, PageSource, PageText, PdfExtractor, PdfPageRenderer,
};
use super::ExtractionError;
use crate::models::enums::ExtractionMethod;

/// Pages with fewer letters and digits than this in their text layer are
/// treated as scanned and sent through OCR when a renderer is available.
pub const MIN_TEXT_LAYER_CHARS: usize = 20;

/// Turns uploaded bytes into sanitized text plus parsed metrics.
///
/// Synchronous and CPU-bound; the processor runs it on the blocking pool.
pub struct DocumentExtractor {
    pdf_extractor: Box<dyn PdfExtractor>,
    pdf_renderer: Option<Box<dyn PdfPageRenderer>>,
    ocr_engine: Box<dyn OcrEngine>,
    vocabulary: Arc<MetricVocabulary>,
    render_dpi: u32,
}

impl DocumentExtractor {
    pub fn new(
        pdf_extractor: Box<dyn PdfExtractor>,
        ocr_engine: Box<dyn OcrEngine>,
        vocabulary: Arc<MetricVocabulary>,
    ) -> Self {
        Self {
            pdf_extractor,
            pdf_renderer: None,
            ocr_engine,
            vocabulary,
            render_dpi: 300,
        }
    }

    /// Add a page renderer so scanned PDF pages can be OCR'd.
    pub fn with_pdf_renderer(mut self, renderer: Box<dyn PdfPageRenderer>, dpi: u32) -> Self {
        self.pdf_renderer = Some(renderer);
        self.render_dpi = dpi;
        self
    }

    pub fn extract(&self, bytes: &[u8], declared_mime: &str) -> Result<ExtractionResult, ExtractionError> {
        let format = validate_upload(bytes, declared_mime)?;

        let (method, pages, ocr_error) = match format {
            FileFormat::Pdf => self.extract_pdf(bytes)?,
            FileFormat::Jpeg | FileFormat::Png | FileFormat::Tiff => {
                let page = self.extract_image(bytes)?;
                (ExtractionMethod::ImageOcr, vec![page], None)
            }
        };

        let raw_text = pages
            .iter()
            .map(|p| p.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        if meaningful_chars(&raw_text) == 0 {
            // A page-level OCR failure explains the empty result better.
            return Err(ocr_error.unwrap_or(ExtractionError::NoReadableText));
        }

        let metrics = self.vocabulary.parse(&raw_text);
        tracing::info!(
            method = method.as_str(),
            pages = pages.len(),
            chars = raw_text.len(),
            metrics = metrics.len(),
            "Extraction complete"
        );

        Ok(ExtractionResult {
            method,
            pages,
            raw_text,
            metrics,
        })
    }

    fn extract_image(&self, bytes: &[u8]) -> Result<PageText, ExtractionError> {
        let png = prepare_for_ocr(bytes)?;
        let ocr = self.ocr_engine.recognize(&png)?;
        tracing::debug!(confidence = ocr.confidence, "Image OCR finished");
        Ok(PageText {
            page_number: 1,
            text: sanitize_extracted_text(&ocr.text),
            source: PageSource::Ocr,
        })
    }

    /// Text layer first; sparse pages go through render + OCR when possible.
    fn extract_pdf(
        &self,
        bytes: &[u8],
    ) -> Result<(ExtractionMethod, Vec<PageText>, Option<ExtractionError>), ExtractionError> {
        let layer_pages = match self.pdf_extractor.extract_pages(bytes) {
            Ok(pages) => pages,
            Err(ExtractionError::PdfParsing(reason)) if self.pdf_renderer.is_some() => {
                tracing::warn!(%reason, "Text layer unreadable, rasterizing every page");
                let count = self
                    .pdf_renderer
                    .as_ref()
                    .map(|r| r.page_count(bytes))
                    .transpose()?
                    .unwrap_or(0);
                vec![String::new(); count]
            }
            Err(e) => return Err(e),
        };

        let mut pages = Vec::with_capacity(layer_pages.len());
        let mut last_ocr_error = None;

        for (index, raw) in layer_pages.iter().enumerate() {
            let text = sanitize_extracted_text(raw);
            let layer_chars = meaningful_chars(&text);

            let mut page = PageText {
                page_number: index + 1,
                text,
                source: PageSource::TextLayer,
            };

            if layer_chars < MIN_TEXT_LAYER_CHARS {
                if let Some(renderer) = &self.pdf_renderer {
                    match self.ocr_page(renderer.as_ref(), bytes, index) {
                        Ok(ocr_text) if meaningful_chars(&ocr_text) > layer_chars => {
                            page.text = ocr_text;
                            page.source = PageSource::Ocr;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(page = index + 1, error = %e, "Page OCR failed");
                            last_ocr_error = Some(e);
                        }
                    }
                }
            }
            pages.push(page);
        }

        let ocr_pages = pages.iter().filter(|p| p.source == PageSource::Ocr).count();
        let method = if ocr_pages == 0 {
            ExtractionMethod::PdfText
        } else if ocr_pages == pages.len() {
            ExtractionMethod::PdfOcr
        } else {
            ExtractionMethod::PdfMixed
        };

        Ok((method, pages, last_ocr_error))
    }

    fn ocr_page(
        &self,
        renderer: &dyn PdfPageRenderer,
        bytes: &[u8],
        index: usize,
    ) -> Result<String, ExtractionError> {
        let png = renderer.render_page(bytes, index, self.render_dpi)?;
        let ocr = self.ocr_engine.recognize(&png)?;
        Ok(sanitize_extracted_text(&ocr.text))
    }
}
