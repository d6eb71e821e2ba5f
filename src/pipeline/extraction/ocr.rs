use std::sync::atomic::{AtomicUsize, Ordering};

use super::types::{OcrEngine, OcrPageResult};
use super::ExtractionError;

/// Tesseract-backed engine. Only available with the `ocr` feature.
#[cfg(feature = "ocr")]
pub struct TesseractEngine {
    tessdata_dir: std::path::PathBuf,
    language: String,
}

#[cfg(feature = "ocr")]
impl TesseractEngine {
    pub fn new(tessdata_dir: &std::path::Path, language: &str) -> Result<Self, ExtractionError> {
        let first_lang = language.split('+').next().unwrap_or("eng");
        if !tessdata_dir.join(format!("{first_lang}.traineddata")).exists() {
            return Err(ExtractionError::TessdataNotFound(tessdata_dir.to_path_buf()));
        }
        tracing::info!(language, "Tesseract OCR ready");
        Ok(Self {
            tessdata_dir: tessdata_dir.to_path_buf(),
            language: language.to_string(),
        })
    }
}

#[cfg(feature = "ocr")]
impl OcrEngine for TesseractEngine {
    fn recognize(&self, png_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        let tessdata = self
            .tessdata_dir
            .to_str()
            .ok_or_else(|| ExtractionError::OcrInit("tessdata path is not UTF-8".into()))?;

        // A Tesseract handle is not Sync; one per call keeps the engine shareable.
        let tess = tesseract::Tesseract::new(Some(tessdata), Some(&self.language))
            .map_err(|e| ExtractionError::OcrInit(format!("{e:?}")))?;
        let mut tess = tess
            .set_image_from_mem(png_bytes)
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;

        let text = tess
            .get_text()
            .map_err(|e| ExtractionError::OcrProcessing(format!("{e:?}")))?;
        let confidence = tess.mean_text_conf().clamp(0, 100) as f32 / 100.0;

        Ok(OcrPageResult { text, confidence })
    }
}

/// Stand-in used when the crate is built without OCR support or the
/// language data is missing. Every call fails with `OcrUnavailable`.
pub struct UnavailableOcrEngine;

impl OcrEngine for UnavailableOcrEngine {
    fn recognize(&self, _png_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        Err(ExtractionError::OcrUnavailable)
    }
}

/// Best OCR engine this build offers for the given configuration.
pub fn default_ocr_engine(tessdata_dir: &std::path::Path, language: &str) -> Box<dyn OcrEngine> {
    #[cfg(feature = "ocr")]
    {
        match TesseractEngine::new(tessdata_dir, language) {
            Ok(engine) => return Box::new(engine),
            Err(e) => tracing::error!(
                error = %e,
                "Tesseract unavailable: image uploads and scanned PDFs will fail extraction"
            ),
        }
    }
    #[cfg(not(feature = "ocr"))]
    {
        let _ = (tessdata_dir, language);
        tracing::error!(
            "Built without the `ocr` feature: image uploads and scanned PDFs will fail extraction"
        );
    }
    Box::new(UnavailableOcrEngine)
}

/// Mock OCR engine for unit testing without Tesseract.
pub struct MockOcrEngine {
    text: String,
    confidence: f32,
    calls: AtomicUsize,
}

impl MockOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            text: text.to_string(),
            confidence,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrEngine for MockOcrEngine {
    fn recognize(&self, png_bytes: &[u8]) -> Result<OcrPageResult, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if png_bytes.is_empty() {
            return Err(ExtractionError::OcrProcessing("empty image".into()));
        }
        Ok(OcrPageResult {
            text: self.text.clone(),
            confidence: self.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_returns_configured_text_and_counts_calls() {
        let engine = MockOcrEngine::new("Hemoglobin 13.5 g/dL", 0.9);
        let result = engine.recognize(&[1, 2, 3]).unwrap();
        assert_eq!(result.text, "Hemoglobin 13.5 g/dL");
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn unavailable_engine_always_fails() {
        let err = UnavailableOcrEngine.recognize(&[1]).unwrap_err();
        assert!(matches!(err, ExtractionError::OcrUnavailable));
    }

    #[test]
    fn default_engine_without_tessdata_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = default_ocr_engine(dir.path(), "eng");
        assert!(matches!(
            engine.recognize(&[1]),
            Err(ExtractionError::OcrUnavailable)
        ));
    }
}
