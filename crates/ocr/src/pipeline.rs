use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, GrayImage, Rgb};
use idscan_core::{ConfigError, ParsedDocument, ProcessorConfig, RawFieldText};
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::decode::{DecoderRegistry, FieldDecoder, ParseError};
use crate::extract::{ExtractError, FieldExtractor};
use crate::overlay;
use crate::preprocess::{self, PreprocessError};
use crate::recognizer::OcrBackend;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Image preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("Field extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("Field parsing failed: {0}")]
    Parse(#[from] ParseError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// What happens to the scratch file written for base64 input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TempFileCleanup {
    #[default]
    Delete,
    /// Leave the file on disk for inspection; its path is logged.
    Keep,
}

/// Orchestrates: normalize geometry → remove shadows → per-field OCR → decode → merge.
///
/// Configuration is fixed at construction, so one processor can serve any
/// number of cards, from any number of threads.
pub struct IdCardProcessor<R: OcrBackend> {
    recognizer: R,
    config: ProcessorConfig,
    decoders: DecoderRegistry,
}

impl<R: OcrBackend> IdCardProcessor<R> {
    /// Processor with the stock field layout.
    pub fn new(recognizer: R) -> Self {
        let config = ProcessorConfig::default();
        let decoders = DecoderRegistry::from_config(&config);
        Self { recognizer, config, decoders }
    }

    pub fn with_config(recognizer: R, config: ProcessorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let decoders = DecoderRegistry::from_config(&config);
        Ok(Self { recognizer, config, decoders })
    }

    /// Register a decoder for a caller-defined (or built-in) field.
    pub fn with_decoder(
        mut self,
        field: impl Into<String>,
        decoder: impl FieldDecoder + 'static,
    ) -> Self {
        self.decoders.register(field, decoder);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    // ── Normalization ────────────────────────────────────────────────────────

    /// Canonical binary image for a photo on disk.
    pub fn preprocess(&self, path: &Path) -> Result<GrayImage, PipelineError> {
        let img = preprocess::load_image(path)?;
        self.preprocess_image(&img)
    }

    pub fn preprocess_image(&self, img: &DynamicImage) -> Result<GrayImage, PipelineError> {
        let canonical = preprocess::prepare_canonical(img, &self.config)?;
        debug!(
            source_width = img.width(),
            source_height = img.height(),
            "normalized to {}x{}",
            canonical.width(),
            canonical.height()
        );
        Ok(canonical)
    }

    // ── Extraction ───────────────────────────────────────────────────────────

    pub fn extract_field_text(&self, canonical: &GrayImage, field: &str) -> Result<String, PipelineError> {
        Ok(FieldExtractor::new(&self.recognizer, &self.config).extract_field(canonical, field)?)
    }

    pub fn extract_all_fields(&self, canonical: &GrayImage) -> Result<RawFieldText, PipelineError> {
        Ok(FieldExtractor::new(&self.recognizer, &self.config).extract_all(canonical)?)
    }

    // ── Full pipeline ────────────────────────────────────────────────────────

    pub fn process_id_card(&self, path: &Path) -> Result<ParsedDocument, PipelineError> {
        debug!(path = %path.display(), "processing id card");
        let img = preprocess::load_image(path)?;
        self.process_image(&img)
    }

    pub fn process_bytes(&self, data: &[u8]) -> Result<ParsedDocument, PipelineError> {
        let img = preprocess::load_image_from_bytes(data)?;
        self.process_image(&img)
    }

    /// Fields are handled in configuration order; the first failure rejects the card.
    pub fn process_image(&self, img: &DynamicImage) -> Result<ParsedDocument, PipelineError> {
        let canonical = self.preprocess_image(img)?;
        let extractor = FieldExtractor::new(&self.recognizer, &self.config);

        let mut doc = ParsedDocument::new();
        for field in self.config.field_names() {
            let text = extractor.extract_field(&canonical, field)?;
            self.decoders.decode_into(&mut doc, field, &text)?;
        }
        debug!(keys = doc.len(), "id card decoded");
        Ok(doc)
    }

    pub fn process_id_card_from_base64(&self, data: &str) -> Result<ParsedDocument, PipelineError> {
        self.process_id_card_from_base64_with(data, TempFileCleanup::Delete)
    }

    /// Decode `data` into a scratch file and run the path-based pipeline on it.
    ///
    /// The scratch file is released on every exit path according to `cleanup`.
    /// Release failures are logged, never returned.
    pub fn process_id_card_from_base64_with(
        &self,
        data: &str,
        cleanup: TempFileCleanup,
    ) -> Result<ParsedDocument, PipelineError> {
        let bytes = decode_base64_image(data)?;

        let suffix = image::guess_format(&bytes)
            .ok()
            .and_then(|format| format.extensions_str().first().copied())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_else(|| ".img".to_string());

        let mut builder = tempfile::Builder::new();
        builder.prefix("idcard-").suffix(&suffix);
        let mut file = match &self.config.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        let result = match file.write_all(&bytes).and_then(|()| file.flush()) {
            Ok(()) => self.process_id_card(file.path()),
            Err(e) => Err(PipelineError::Io(e)),
        };

        match cleanup {
            TempFileCleanup::Delete => {
                let path = file.path().to_path_buf();
                if let Err(e) = file.close() {
                    warn!(path = %path.display(), error = %e, "failed to remove temporary image");
                }
            }
            TempFileCleanup::Keep => match file.keep() {
                Ok((_, path)) => info!(path = %path.display(), "kept temporary image"),
                Err(e) => warn!(error = %e.error, "failed to keep temporary image"),
            },
        }

        result
    }

    // ── Debug output ─────────────────────────────────────────────────────────

    pub fn save_processed_image(&self, path: &Path, out: &Path) -> Result<(), PipelineError> {
        let canonical = self.preprocess(path)?;
        canonical
            .save(out)
            .map_err(|e| PreprocessError::Encode(e.to_string()))?;
        Ok(())
    }

    /// Write the canonical image with every configured field box outlined.
    pub fn draw_crop_grid(
        &self,
        path: &Path,
        out: &Path,
        color: Rgb<u8>,
        thickness: u32,
    ) -> Result<(), PipelineError> {
        let canonical = self.preprocess(path)?;
        let grid = overlay::draw_field_boxes(&canonical, self.config.fields.values(), color, thickness);
        grid.save(out)
            .map_err(|e| PreprocessError::Encode(e.to_string()))?;
        Ok(())
    }
}

/// Strip an optional `data:...,` prefix and whitespace, then decode standard base64.
pub fn decode_base64_image(data: &str) -> Result<Vec<u8>, PipelineError> {
    let trimmed = data.trim_start();
    let payload = match trimmed.split_once(',') {
        Some((head, rest)) if head.starts_with("data:") => rest,
        _ => trimmed,
    };
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(STANDARD.decode(compact)?)
}

pub fn image_to_base64(path: &Path) -> Result<String, PipelineError> {
    let bytes = std::fs::read(path)?;
    Ok(STANDARD.encode(bytes))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodedFields;
    use crate::recognizer::{MockRecognizer, OcrError};
    use idscan_core::{FieldBox, FieldConfig};
    use image::{ImageBuffer, ImageFormat, RgbImage};
    use std::io::Cursor;

    /// Portrait capture, as the phone camera delivers it.
    fn card_photo() -> RgbImage {
        ImageBuffer::from_fn(120, 200, |x, y| {
            if (x + y) % 17 == 0 {
                image::Rgb([30, 30, 30])
            } else {
                image::Rgb([220, 215, 210])
            }
        })
    }

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        card_photo().write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    fn card_ocr() -> MockRecognizer {
        MockRecognizer::new("")
            .with_field("full_name", "IDROUPOPESCU<<ION<<<<<<<<")
            .with_field("serie_nr", "cj 123456")
            .with_field("place_of_birth", "Mun.Cluj-Napoca\nJud.CJ")
            .with_field("address", "Str. Lunga  nr. 5")
            .with_field("cnp", "990101M300517123456")
    }

    fn processor_in(dir: &Path, ocr: MockRecognizer) -> IdCardProcessor<MockRecognizer> {
        let config = ProcessorConfig::default().with_temp_dir(dir);
        IdCardProcessor::with_config(ocr, config).unwrap()
    }

    fn dir_entries(dir: &Path) -> Vec<std::path::PathBuf> {
        std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect()
    }

    #[test]
    fn decodes_every_default_field() {
        let processor = IdCardProcessor::new(card_ocr());
        let doc = processor.process_bytes(&encoded(ImageFormat::Png)).unwrap();

        assert_eq!(doc.get("last_name"), Some("POPESCU"));
        assert_eq!(doc.get("first_name"), Some("ION"));
        assert_eq!(doc.get("serie"), Some("CJ"));
        assert_eq!(doc.get("nr"), Some("123456"));
        assert_eq!(doc.get("place_of_birth"), Some("Mun.Cluj-Napoca Jud.CJ"));
        assert_eq!(doc.get("address"), Some("Str. Lunga nr. 5"));
        assert_eq!(doc.get("cnp"), Some("1990101123456"));
        assert_eq!(doc.get("expiration_date"), Some("300517"));
        assert_eq!(doc.len(), 8);
    }

    #[test]
    fn base64_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor_in(dir.path(), card_ocr());
        let data = STANDARD.encode(encoded(ImageFormat::Png));

        let first = processor.process_id_card_from_base64(&data).unwrap();
        let second = processor.process_id_card_from_base64(&data).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn temp_file_removed_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor_in(dir.path(), card_ocr());
        let data = STANDARD.encode(encoded(ImageFormat::Jpeg));

        processor.process_id_card_from_base64(&data).unwrap();
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn temp_file_removed_after_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor_in(dir.path(), card_ocr());
        let data = STANDARD.encode(b"definitely not an image");

        let err = processor.process_id_card_from_base64(&data).unwrap_err();
        assert!(matches!(err, PipelineError::Preprocess(PreprocessError::Decode(_))));
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn temp_file_removed_after_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor_in(dir.path(), card_ocr().with_field("cnp", "9901011234567"));
        let data = STANDARD.encode(encoded(ImageFormat::Png));

        let err = processor.process_id_card_from_base64(&data).unwrap_err();
        assert!(matches!(err, PipelineError::Parse(ParseError::MissingGenderMarker(_))));
        assert!(dir_entries(dir.path()).is_empty());
    }

    /// Engine that breaks on one field and answers the rest from `inner`.
    struct FailingOn {
        field: &'static str,
        inner: MockRecognizer,
    }

    impl OcrBackend for FailingOn {
        fn recognize(&self, field: &str, image_png: &[u8], config: &FieldConfig) -> Result<String, OcrError> {
            if field == self.field {
                return Err(OcrError::Engine(format!("engine crashed on {field}")));
            }
            self.inner.recognize(field, image_png, config)
        }
    }

    #[test]
    fn temp_file_removed_after_ocr_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ocr = FailingOn { field: "cnp", inner: card_ocr() };
        let config = ProcessorConfig::default().with_temp_dir(dir.path());
        let processor = IdCardProcessor::with_config(ocr, config).unwrap();
        let data = STANDARD.encode(encoded(ImageFormat::Png));

        let err = processor.process_id_card_from_base64(&data).unwrap_err();
        assert!(matches!(err, PipelineError::Extract(ExtractError::Ocr(OcrError::Engine(_)))));
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn keep_leaves_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor_in(dir.path(), card_ocr());
        let data = STANDARD.encode(encoded(ImageFormat::Png));

        processor
            .process_id_card_from_base64_with(&data, TempFileCleanup::Keep)
            .unwrap();
        let entries = dir_entries(dir.path());
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("idcard-"), "{name}");
        assert!(name.ends_with(".png"), "{name}");
    }

    #[test]
    fn data_url_prefix_and_line_breaks_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor_in(dir.path(), card_ocr());
        let raw = STANDARD.encode(encoded(ImageFormat::Png));
        let wrapped: Vec<String> = raw
            .as_bytes()
            .chunks(76)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        let data = format!("data:image/png;base64,{}", wrapped.join("\n"));

        let doc = processor.process_id_card_from_base64(&data).unwrap();
        assert_eq!(doc.get("cnp"), Some("1990101123456"));
    }

    #[test]
    fn malformed_base64_is_rejected_before_any_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor_in(dir.path(), card_ocr());

        let err = processor.process_id_card_from_base64("***not base64***").unwrap_err();
        assert!(matches!(err, PipelineError::Base64(_)));
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn decode_base64_image_strips_prefix() {
        assert_eq!(decode_base64_image("data:text/plain;base64,aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_base64_image("  aGVs\r\nbG8=\n").unwrap(), b"hello");
    }

    #[test]
    fn image_to_base64_round_trips_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.png");
        std::fs::write(&path, encoded(ImageFormat::Png)).unwrap();

        let text = image_to_base64(&path).unwrap();
        assert_eq!(STANDARD.decode(text).unwrap(), std::fs::read(&path).unwrap());
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = ProcessorConfig::default().with_field("huge", FieldBox::new(0, 0, 5000, 10), None);
        assert!(IdCardProcessor::with_config(card_ocr(), config).is_err());
    }

    #[test]
    fn caller_defined_fields_flow_through() {
        let config = ProcessorConfig::default().with_field("issuer", FieldBox::new(0, 300, 300, 325), None);
        let ocr = card_ocr().with_field("issuer", "SPCLEP  Cluj");
        let processor = IdCardProcessor::with_config(ocr, config)
            .unwrap()
            .with_decoder("issuer", |raw: &str| -> Result<DecodedFields, ParseError> {
                Ok(vec![("issued_by".to_string(), raw.to_uppercase())])
            });

        let doc = processor.process_bytes(&encoded(ImageFormat::Png)).unwrap();
        assert_eq!(doc.get("issued_by"), Some("SPCLEP  CLUJ"));
        assert_eq!(doc.get("issuer"), None);
    }

    #[test]
    fn unknown_field_text_is_rejected() {
        let processor = IdCardProcessor::new(card_ocr());
        let canonical = processor.preprocess_image(&DynamicImage::ImageRgb8(card_photo())).unwrap();
        let err = processor.extract_field_text(&canonical, "blood_type").unwrap_err();
        assert!(matches!(err, PipelineError::Extract(ExtractError::UnknownField(_))));
    }

    #[test]
    fn debug_images_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("card.jpg");
        std::fs::write(&photo, encoded(ImageFormat::Jpeg)).unwrap();
        let processor = IdCardProcessor::new(card_ocr());

        let processed = dir.path().join("processed.png");
        processor.save_processed_image(&photo, &processed).unwrap();
        let img = image::open(&processed).unwrap().to_luma8();
        assert_eq!(img.dimensions(), (1000, 325));

        let grid = dir.path().join("grid.png");
        processor
            .draw_crop_grid(&photo, &grid, Rgb([0, 255, 0]), 2)
            .unwrap();
        let overlay = image::open(&grid).unwrap().to_rgb8();
        // Top-left corner of the cnp box.
        assert_eq!(overlay.get_pixel(395, 250), &Rgb([0, 255, 0]));
    }
}
