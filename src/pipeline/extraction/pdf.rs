use super::types::PdfExtractor;
use super::ExtractionError;

/// Embedded text layer extraction via the pdf-extract crate.
pub struct PdfTextExtractor;

impl PdfExtractor for PdfTextExtractor {
    fn extract_pages(&self, pdf_bytes: &[u8]) -> Result<Vec<String>, ExtractionError> {
        pdf_extract::extract_text_from_mem_by_pages(pdf_bytes).map_err(|e| {
            let msg = e.to_string();
            if msg.to_lowercase().contains("encrypt") {
                ExtractionError::PdfEncrypted
            } else {
                ExtractionError::PdfParsing(msg)
            }
        })
    }
}

/// Build a text-only PDF with one page per entry; each page holds its
/// lines top to bottom.
#[cfg(test)]
pub(crate) fn make_test_pdf(pages: &[&[&str]]) -> Vec<u8> {
    use lopdf::dictionary;
    use lopdf::{Document, Object, Stream};

    let mut doc = Document::with_version("1.4");

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let pages_id = doc.new_object_id();

    let mut kids: Vec<Object> = Vec::new();
    for lines in pages {
        let mut content = String::from("BT /F1 12 Tf 72 720 Td");
        for line in lines.iter() {
            content.push_str(&format!(" ({line}) Tj 0 -14 Td"));
        }
        content.push_str(" ET");
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_per_page() {
        let pdf = make_test_pdf(&[&["Glucose: 95 mg/dL"], &["Hemoglobin 13.5 g/dL"]]);
        let pages = PdfTextExtractor.extract_pages(&pdf).unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].contains("Glucose"));
        assert!(pages[1].contains("Hemoglobin"));
    }

    #[test]
    fn blank_page_yields_empty_text() {
        let pdf = make_test_pdf(&[&[]]);
        let pages = PdfTextExtractor.extract_pages(&pdf).unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].trim().is_empty());
    }

    #[test]
    fn invalid_pdf_returns_error() {
        assert!(PdfTextExtractor.extract_pages(b"%PDF-1.4 truncated").is_err());
    }
}
