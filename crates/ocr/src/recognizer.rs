use idscan_core::FieldConfig;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Image decode error: {0}")]
    ImageDecode(String),
    #[error("OCR engine error: {0}")]
    Engine(String),
    #[error("OCR engine not available: {0}")]
    NotAvailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstraction over an OCR backend.
///
/// Implementations receive one field's PNG crop plus its recognition settings
/// and return whatever text the engine produced. Noisy or empty text is not
/// an error; only a failing engine is.
pub trait OcrBackend: Send + Sync {
    fn recognize(&self, field: &str, image_png: &[u8], config: &FieldConfig)
        -> Result<String, OcrError>;
}

impl<T: OcrBackend + ?Sized> OcrBackend for &T {
    fn recognize(&self, field: &str, image_png: &[u8], config: &FieldConfig) -> Result<String, OcrError> {
        (**self).recognize(field, image_png, config)
    }
}

impl<T: OcrBackend + ?Sized> OcrBackend for Box<T> {
    fn recognize(&self, field: &str, image_png: &[u8], config: &FieldConfig) -> Result<String, OcrError> {
        (**self).recognize(field, image_png, config)
    }
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Returns preset text per field, ignoring the image.
#[derive(Debug, Clone, Default)]
pub struct MockRecognizer {
    pub text: String,
    pub per_field: HashMap<String, String>,
}

impl MockRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), per_field: HashMap::new() }
    }

    pub fn with_field(mut self, field: impl Into<String>, text: impl Into<String>) -> Self {
        self.per_field.insert(field.into(), text.into());
        self
    }
}

impl OcrBackend for MockRecognizer {
    fn recognize(&self, field: &str, _image_png: &[u8], _config: &FieldConfig) -> Result<String, OcrError> {
        Ok(self.per_field.get(field).unwrap_or(&self.text).clone())
    }
}

// ── Tesseract command-line backend ────────────────────────────────────────────

/// Runs the `tesseract` binary on a scratch PNG per field.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    binary: PathBuf,
    data_dir: Option<PathBuf>,
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new()
    }
}

impl TesseractCli {
    pub fn new() -> Self {
        Self { binary: PathBuf::from("tesseract"), data_dir: None }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Directory holding the `*.traineddata` language packs.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn command(&self, image: &std::path::Path, config: &FieldConfig) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(image).arg("stdout");
        if let Some(dir) = &self.data_dir {
            cmd.arg("--tessdata-dir").arg(dir);
        }
        cmd.args(config.to_args());
        cmd
    }
}

impl OcrBackend for TesseractCli {
    fn recognize(&self, field: &str, image_png: &[u8], config: &FieldConfig) -> Result<String, OcrError> {
        let mut scratch = tempfile::Builder::new()
            .prefix("idscan-field-")
            .suffix(".png")
            .tempfile()?;
        scratch.write_all(image_png)?;
        scratch.flush()?;

        tracing::debug!(field, settings = %config, "running tesseract");
        let output = self.command(scratch.path(), config).output();

        match output {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(OcrError::Engine(format!("tesseract failed on '{field}': {}", stderr.trim())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OcrError::NotAvailable(
                format!("{} not found (install tesseract-ocr)", self.binary.display()),
            )),
            Err(e) => Err(OcrError::Io(e)),
        }
    }
}

// ── Tesseract library backend (optional, gated behind `tesseract` feature) ────

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{OcrBackend, OcrError};
    use idscan_core::FieldConfig;
    use leptess::{LepTess, Variable};

    pub struct TesseractRecognizer {
        data_path: Option<String>,
    }

    impl TesseractRecognizer {
        pub fn new(data_path: Option<String>) -> Self {
            Self { data_path }
        }
    }

    impl OcrBackend for TesseractRecognizer {
        fn recognize(&self, field: &str, image_png: &[u8], config: &FieldConfig) -> Result<String, OcrError> {
            let mut lt = LepTess::new(self.data_path.as_deref(), &config.language)
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            lt.set_variable(Variable::TesseditPagesegMode, &config.psm.to_string())
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            if let Some(chars) = &config.whitelist {
                lt.set_variable(Variable::TesseditCharWhitelist, chars)
                    .map_err(|e| OcrError::Engine(e.to_string()))?;
            }
            if config.oem.is_some() {
                // Engine mode is fixed when the library handle is created.
                tracing::debug!(field, "ignoring oem setting for in-process tesseract");
            }
            lt.set_image_from_mem(image_png)
                .map_err(|e| OcrError::ImageDecode(e.to_string()))?;
            lt.get_utf8_text().map_err(|e| OcrError::Engine(e.to_string()))
        }
    }
}
