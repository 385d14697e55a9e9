pub mod config;
pub mod document;
pub mod field;

pub use config::{BinarizeParams, CollisionPolicy, ConfigError, ProcessorConfig, DEFAULT_CENTURY_PIVOT};
pub use document::{ParsedDocument, RawFieldText};
pub use field::{names, CanonicalSize, CropRegion, FieldBox, FieldConfig};
