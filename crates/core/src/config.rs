use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::field::{names, CanonicalSize, CropRegion, FieldBox, FieldConfig};

/// Two-digit birth years strictly above this pivot are read as 19xx, the rest as 20xx.
pub const DEFAULT_CENTURY_PIVOT: u32 = 20;

const NAME_WHITELIST: &str = "AĂÂBCDEFGHIÎJKLMNOPQRSȘTȚUVWXYZ<";
const SERIE_WHITELIST: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ<";
const CNP_WHITELIST: &str = "0123456789MF";
const FREE_TEXT_WHITELIST: &str =
    " abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZăâîșțĂÂÎȘȚ.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to render config TOML: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("Crop region {0:?} must lie within [0, 1] with x1 < x2 and y1 < y2")]
    InvalidCropRegion(CropRegion),
    #[error("Canonical size must be non-zero, got {width}x{height}")]
    EmptyCanonicalSize { width: u32, height: u32 },
    #[error("No fields configured")]
    NoFields,
    #[error("Field '{field}' box {bbox} does not fit the {width}x{height} canonical space")]
    FieldOutOfBounds {
        field: String,
        bbox: FieldBox,
        width: u32,
        height: u32,
    },
    #[error("OCR settings given for '{0}', which has no crop box")]
    OrphanOcrConfig(String),
    #[error("Median kernel must be odd and positive, got {0}")]
    InvalidMedianKernel(u32),
    #[error("CLAHE tile grid must be non-zero")]
    EmptyTileGrid,
    #[error("CLAHE clip limit must be positive, got {0}")]
    InvalidClipLimit(f32),
}

/// What to do when two fields decode to the same semantic key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Fail the whole document.
    #[default]
    Reject,
    /// Keep the value from the field decoded last.
    LastWriteWins,
}

/// Shadow removal and thresholding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinarizeParams {
    /// Median blur kernel used to estimate the background (odd).
    pub median_kernel: u32,
    pub clahe_clip_limit: f32,
    /// Tiles per axis for local contrast enhancement.
    pub clahe_tile_grid: u32,
    /// Global threshold; pixels strictly above it turn white.
    pub threshold: u8,
}

impl Default for BinarizeParams {
    fn default() -> Self {
        BinarizeParams {
            median_kernel: 61,
            clahe_clip_limit: 2.0,
            clahe_tile_grid: 8,
            threshold: 80,
        }
    }
}

/// Immutable settings for one ID card processor.
///
/// A supplied `[fields]` or `[ocr]` table replaces the default set entirely,
/// every other missing key falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub cnp_century_pivot: u32,
    pub collision_policy: CollisionPolicy,
    /// Where base64 input is staged; the OS temp dir when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    pub crop_region: CropRegion,
    pub canonical_size: CanonicalSize,
    pub binarize: BinarizeParams,
    pub fields: BTreeMap<String, FieldBox>,
    pub ocr: BTreeMap<String, FieldConfig>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        let fields = BTreeMap::from([
            (names::FULL_NAME.to_string(), FieldBox::new(50, 190, 990, 245)),
            (names::SERIE_NR.to_string(), FieldBox::new(50, 240, 265, 290)),
            (names::PLACE_OF_BIRTH.to_string(), FieldBox::new(300, 0, 750, 35)),
            (names::ADDRESS.to_string(), FieldBox::new(285, 52, 900, 86)),
            (names::CNP.to_string(), FieldBox::new(395, 250, 980, 300)),
        ]);

        let free_text = FieldConfig::new(13).with_whitelist(FREE_TEXT_WHITELIST);
        let ocr = BTreeMap::from([
            (names::PLACE_OF_BIRTH.to_string(), free_text.clone()),
            (names::ADDRESS.to_string(), free_text),
            (
                names::FULL_NAME.to_string(),
                FieldConfig::new(7).with_oem(3).with_whitelist(NAME_WHITELIST),
            ),
            (
                names::SERIE_NR.to_string(),
                FieldConfig::new(7).with_oem(3).with_whitelist(SERIE_WHITELIST),
            ),
            (
                names::CNP.to_string(),
                FieldConfig::new(7).with_oem(3).with_whitelist(CNP_WHITELIST),
            ),
        ]);

        ProcessorConfig {
            cnp_century_pivot: DEFAULT_CENTURY_PIVOT,
            collision_policy: CollisionPolicy::default(),
            temp_dir: None,
            crop_region: CropRegion::default(),
            canonical_size: CanonicalSize::default(),
            binarize: BinarizeParams::default(),
            fields,
            ocr,
        }
    }
}

impl ProcessorConfig {
    /// Parse and validate a TOML document.
    ///
    /// When `[fields]` is overridden without an `[ocr]` table, default OCR
    /// settings are kept only for the fields that are still configured.
    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml_content.parse()?;
        let explicit_ocr = table.contains_key("ocr");
        let mut config: ProcessorConfig = toml::Value::Table(table).try_into()?;
        if !explicit_ocr {
            let fields = &config.fields;
            config.ocr.retain(|name, _| fields.contains_key(name));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.crop_region.is_valid() {
            return Err(ConfigError::InvalidCropRegion(self.crop_region));
        }

        let size = self.canonical_size;
        if size.width == 0 || size.height == 0 {
            return Err(ConfigError::EmptyCanonicalSize {
                width: size.width,
                height: size.height,
            });
        }

        if self.fields.is_empty() {
            return Err(ConfigError::NoFields);
        }
        for (field, bbox) in &self.fields {
            if !bbox.fits_within(size) {
                return Err(ConfigError::FieldOutOfBounds {
                    field: field.clone(),
                    bbox: *bbox,
                    width: size.width,
                    height: size.height,
                });
            }
        }
        if let Some(orphan) = self.ocr.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(ConfigError::OrphanOcrConfig(orphan.clone()));
        }

        let b = &self.binarize;
        if b.median_kernel == 0 || b.median_kernel % 2 == 0 {
            return Err(ConfigError::InvalidMedianKernel(b.median_kernel));
        }
        if b.clahe_tile_grid == 0 {
            return Err(ConfigError::EmptyTileGrid);
        }
        if b.clahe_clip_limit.is_nan() || b.clahe_clip_limit <= 0.0 {
            return Err(ConfigError::InvalidClipLimit(b.clahe_clip_limit));
        }
        Ok(())
    }

    pub fn with_crop_region(mut self, region: CropRegion) -> Self {
        self.crop_region = region;
        self
    }

    pub fn with_canonical_size(mut self, width: u32, height: u32) -> Self {
        self.canonical_size = CanonicalSize { width, height };
        self
    }

    pub fn with_binarize(mut self, params: BinarizeParams) -> Self {
        self.binarize = params;
        self
    }

    /// Add or replace a field; `None` drops any OCR settings it had.
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        bbox: FieldBox,
        ocr: Option<FieldConfig>,
    ) -> Self {
        let name = name.into();
        match ocr {
            Some(cfg) => self.ocr.insert(name.clone(), cfg),
            None => self.ocr.remove(&name),
        };
        self.fields.insert(name, bbox);
        self
    }

    pub fn without_field(mut self, name: &str) -> Self {
        self.fields.remove(name);
        self.ocr.remove(name);
        self
    }

    pub fn with_century_pivot(mut self, pivot: u32) -> Self {
        self.cnp_century_pivot = pivot;
        self
    }

    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision_policy = policy;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Recognition settings for `field`, falling back to the engine defaults.
    pub fn field_config(&self, field: &str) -> FieldConfig {
        self.ocr.get(field).cloned().unwrap_or_default()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}
