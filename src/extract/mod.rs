//! Document text extraction: format detection, text recovery, OCR,
//! quality scoring and segmentation.

pub mod ocr;
pub mod text;

pub use ocr::OcrEngine;
pub use text::{
    detect_kind, extract_text, segment_text, text_quality, truncate_chars, zip_first_pdf, DocKind,
};
