use image::{imageops, GrayImage};
use idscan_core::{ProcessorConfig, RawFieldText};
use thiserror::Error;

use crate::preprocess::{self, PreprocessError};
use crate::recognizer::{OcrBackend, OcrError};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Unknown field: {0}")]
    UnknownField(String),
    #[error("Failed to encode field crop: {0}")]
    Encode(#[from] PreprocessError),
    #[error("OCR recognition failed: {0}")]
    Ocr(#[from] OcrError),
}

/// Crops configured field boxes out of a canonical image and runs OCR on each.
pub struct FieldExtractor<'a, R: OcrBackend + ?Sized> {
    recognizer: &'a R,
    config: &'a ProcessorConfig,
}

impl<'a, R: OcrBackend + ?Sized> FieldExtractor<'a, R> {
    pub fn new(recognizer: &'a R, config: &'a ProcessorConfig) -> Self {
        Self { recognizer, config }
    }

    /// Recognize one field. Noisy output comes back as-is for the decoder to judge.
    pub fn extract_field(&self, canonical: &GrayImage, field: &str) -> Result<String, ExtractError> {
        let bbox = self
            .config
            .fields
            .get(field)
            .ok_or_else(|| ExtractError::UnknownField(field.to_string()))?;

        let crop = imageops::crop_imm(canonical, bbox.x1, bbox.y1, bbox.width(), bbox.height())
            .to_image();
        let png = preprocess::encode_png(&crop)?;
        let settings = self.config.field_config(field);

        let text = self.recognizer.recognize(field, &png, &settings)?;
        let text = clean_ocr_text(&text);
        tracing::debug!(field, %bbox, text = %text, "field recognized");
        Ok(text)
    }

    pub fn extract_all(&self, canonical: &GrayImage) -> Result<RawFieldText, ExtractError> {
        let mut raw = RawFieldText::new();
        for field in self.config.field_names() {
            raw.insert(field, self.extract_field(canonical, field)?);
        }
        Ok(raw)
    }
}

/// Trim and fold line breaks into single spaces.
pub fn clean_ocr_text(text: &str) -> String {
    text.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::MockRecognizer;
    use idscan_core::{FieldBox, FieldConfig};
    use image::{ImageBuffer, Luma};
    use std::sync::Mutex;

    fn canonical() -> GrayImage {
        ImageBuffer::from_fn(1000, 325, |_, _| Luma([255u8]))
    }

    /// Records what the extractor asked for.
    #[derive(Default)]
    struct Spy {
        calls: Mutex<Vec<(String, (u32, u32), FieldConfig)>>,
    }

    impl OcrBackend for Spy {
        fn recognize(&self, field: &str, image_png: &[u8], config: &FieldConfig) -> Result<String, OcrError> {
            let img = image::load_from_memory(image_png).unwrap();
            self.calls
                .lock()
                .unwrap()
                .push((field.to_string(), (img.width(), img.height()), config.clone()));
            Ok(String::new())
        }
    }

    #[test]
    fn clean_ocr_text_folds_line_breaks() {
        assert_eq!(clean_ocr_text("  CLUJ\nNAPOCA \n"), "CLUJ NAPOCA");
        assert_eq!(clean_ocr_text("STR. X\r\n\r\nNR. 5"), "STR. X NR. 5");
        assert_eq!(clean_ocr_text("\n\n"), "");
    }

    #[test]
    fn clean_ocr_text_drops_blank_lines() {
        // One space per break between text lines, however many blank lines sit between.
        assert_eq!(clean_ocr_text("A\n\nB"), "A B");
        assert_eq!(clean_ocr_text("990101M\n\n\n300517"), "990101M 300517");
        // Spaces inside a line are untouched.
        assert_eq!(clean_ocr_text("A  B\nC"), "A  B C");
    }

    #[test]
    fn unknown_field_is_rejected() {
        let config = ProcessorConfig::default();
        let ocr = MockRecognizer::new("anything");
        let extractor = FieldExtractor::new(&ocr, &config);
        let err = extractor.extract_field(&canonical(), "blood_type").unwrap_err();
        assert!(matches!(err, ExtractError::UnknownField(f) if f == "blood_type"));
    }

    #[test]
    fn crops_box_and_passes_field_settings() {
        let config = ProcessorConfig::default();
        let spy = Spy::default();
        FieldExtractor::new(&spy, &config)
            .extract_field(&canonical(), "cnp")
            .unwrap();

        let calls = spy.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (field, dims, settings) = &calls[0];
        assert_eq!(field, "cnp");
        assert_eq!(*dims, (585, 50));
        assert_eq!(settings.whitelist.as_deref(), Some("0123456789MF"));
    }

    #[test]
    fn unconfigured_settings_fall_back_to_defaults() {
        let config = ProcessorConfig::default()
            .with_field("issuer", FieldBox::new(0, 300, 200, 325), None);
        let spy = Spy::default();
        FieldExtractor::new(&spy, &config)
            .extract_field(&canonical(), "issuer")
            .unwrap();
        assert_eq!(spy.calls.lock().unwrap()[0].2, FieldConfig::default());
    }

    #[test]
    fn extract_all_covers_every_configured_field() {
        let config = ProcessorConfig::default();
        let ocr = MockRecognizer::new("").with_field("address", "JUD. CJ\nMUN. CLUJ");
        let raw = FieldExtractor::new(&ocr, &config).extract_all(&canonical()).unwrap();
        assert_eq!(raw.len(), 5);
        assert_eq!(raw.get("address"), Some("JUD. CJ MUN. CLUJ"));
        assert_eq!(raw.get("cnp"), Some(""));
    }
}
