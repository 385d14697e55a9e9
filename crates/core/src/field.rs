use serde::{Deserialize, Serialize};
use std::fmt;

/// Field names understood by the default configuration and decoder registry.
pub mod names {
    pub const FULL_NAME: &str = "full_name";
    pub const SERIE_NR: &str = "serie_nr";
    pub const PLACE_OF_BIRTH: &str = "place_of_birth";
    pub const ADDRESS: &str = "address";
    pub const CNP: &str = "cnp";
}

/// Relative rectangle (fractions of width/height) kept after rotation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropRegion {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Default for CropRegion {
    /// Lower band of the rotated capture, where the machine-readable lines sit.
    fn default() -> Self {
        CropRegion { x1: 0.0, y1: 0.477, x2: 1.0, y2: 0.94 }
    }
}

impl CropRegion {
    pub fn is_valid(&self) -> bool {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        in_unit(self.x1)
            && in_unit(self.y1)
            && in_unit(self.x2)
            && in_unit(self.y2)
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    /// Resolve the fractions against an image of `width`×`height`, flooring to whole pixels.
    pub fn to_pixels(&self, width: u32, height: u32) -> FieldBox {
        let scale = |frac: f64, extent: u32| ((frac * extent as f64) as u32).min(extent);
        FieldBox {
            x1: scale(self.x1, width),
            y1: scale(self.y1, height),
            x2: scale(self.x2, width),
            y2: scale(self.y2, height),
        }
    }
}

/// Absolute pixel rectangle, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl FieldBox {
    pub const fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        FieldBox { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn fits_within(&self, size: CanonicalSize) -> bool {
        !self.is_empty() && self.x2 <= size.width && self.y2 <= size.height
    }
}

impl fmt::Display for FieldBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// The fixed coordinate space every [`FieldBox`] is expressed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalSize {
    pub width: u32,
    pub height: u32,
}

impl Default for CanonicalSize {
    fn default() -> Self {
        CanonicalSize { width: 1000, height: 325 }
    }
}

pub const DEFAULT_LANGUAGE: &str = "ron";
pub const DEFAULT_PSM: u8 = 7;

/// Per-field recognition settings handed to the OCR engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Characters the engine may emit; `None` leaves the engine unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<String>,
    /// Page segmentation mode.
    #[serde(default = "default_psm")]
    pub psm: u8,
    /// Engine mode; `None` keeps the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oem: Option<u8>,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_psm() -> u8 {
    DEFAULT_PSM
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl Default for FieldConfig {
    fn default() -> Self {
        FieldConfig {
            whitelist: None,
            psm: DEFAULT_PSM,
            oem: None,
            language: default_language(),
        }
    }
}

impl FieldConfig {
    pub fn new(psm: u8) -> Self {
        FieldConfig { psm, ..Self::default() }
    }

    pub fn with_whitelist(mut self, chars: impl Into<String>) -> Self {
        self.whitelist = Some(chars.into());
        self
    }

    pub fn with_oem(mut self, oem: u8) -> Self {
        self.oem = Some(oem);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Tesseract command-line arguments for these settings (everything after the output base).
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-l".to_string(),
            self.language.clone(),
            "--psm".to_string(),
            self.psm.to_string(),
        ];
        if let Some(oem) = self.oem {
            args.push("--oem".to_string());
            args.push(oem.to_string());
        }
        if let Some(chars) = &self.whitelist {
            args.push("-c".to_string());
            args.push(format!("tessedit_char_whitelist={chars}"));
        }
        args
    }
}

impl fmt::Display for FieldConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-l {} --psm {}", self.language, self.psm)?;
        if let Some(oem) = self.oem {
            write!(f, " --oem {oem}")?;
        }
        if let Some(chars) = &self.whitelist {
            write!(f, " -c tessedit_char_whitelist='{chars}'")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_crop_region_is_lower_band() {
        let region = CropRegion::default();
        assert!(region.is_valid());
        let px = region.to_pixels(800, 1000);
        assert_eq!((px.x1, px.x2), (0, 800));
        assert!(px.y1 >= 470 && px.y2 <= 940 && px.y1 < px.y2);
    }

    #[test]
    fn crop_region_floors_to_pixels() {
        let region = CropRegion { x1: 0.25, y1: 0.5, x2: 0.75, y2: 1.0 };
        assert_eq!(region.to_pixels(1001, 2001), FieldBox::new(250, 1000, 750, 2001));
    }

    #[test]
    fn crop_region_rejects_inverted_or_out_of_range() {
        assert!(!CropRegion { x1: 0.5, y1: 0.0, x2: 0.4, y2: 1.0 }.is_valid());
        assert!(!CropRegion { x1: 0.0, y1: 0.0, x2: 1.2, y2: 1.0 }.is_valid());
        assert!(!CropRegion { x1: 0.0, y1: 0.3, x2: 1.0, y2: 0.3 }.is_valid());
    }

    #[test]
    fn field_box_bounds() {
        let size = CanonicalSize::default();
        assert!(FieldBox::new(50, 190, 990, 245).fits_within(size));
        assert!(FieldBox::new(0, 0, 1000, 325).fits_within(size));
        assert!(!FieldBox::new(0, 0, 1001, 325).fits_within(size));
        assert!(!FieldBox::new(10, 10, 10, 20).fits_within(size));
    }

    #[test]
    fn field_config_args() {
        let cfg = FieldConfig::new(7).with_oem(3).with_whitelist("0123456789MF");
        assert_eq!(
            cfg.to_args(),
            vec!["-l", "ron", "--psm", "7", "--oem", "3", "-c", "tessedit_char_whitelist=0123456789MF"]
        );
        assert_eq!(
            cfg.to_string(),
            "-l ron --psm 7 --oem 3 -c tessedit_char_whitelist='0123456789MF'"
        );
    }

    #[test]
    fn field_config_defaults_when_deserialized_sparse() {
        let cfg: FieldConfig = toml::from_str("psm = 13").unwrap();
        assert_eq!(cfg.psm, 13);
        assert_eq!(cfg.language, "ron");
        assert!(cfg.whitelist.is_none());
        assert!(cfg.oem.is_none());
    }
}
