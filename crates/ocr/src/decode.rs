//! Field decoders: turn one field's OCR text into semantic key/value pairs.
//!
//! Decoders are pure and registered by field name, so callers can add their
//! own field types without touching the built-in ones. Fields without a
//! registered decoder fall back to a whitespace-collapsed passthrough keyed by
//! the field name.

use idscan_core::{names, CollisionPolicy, ParsedDocument, ProcessorConfig, RawFieldText};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("No M or F gender marker in CNP text '{0}'")]
    MissingGenderMarker(String),
    #[error("More than one gender marker in CNP text '{0}'")]
    AmbiguousGenderMarker(String),
    #[error("CNP text '{0}' does not start with a two-digit year")]
    InvalidYear(String),
    #[error("Field '{field}' produced key '{key}', which another field already set")]
    KeyCollision { field: String, key: String },
    #[error("Malformed '{field}' text: {reason}")]
    Malformed { field: String, reason: String },
}

/// Key/value pairs produced by one decoder, in output order.
pub type DecodedFields = Vec<(String, String)>;

pub trait FieldDecoder: Send + Sync {
    fn decode(&self, raw: &str) -> Result<DecodedFields, ParseError>;
}

impl<F> FieldDecoder for F
where
    F: Fn(&str) -> Result<DecodedFields, ParseError> + Send + Sync,
{
    fn decode(&self, raw: &str) -> Result<DecodedFields, ParseError> {
        self(raw)
    }
}

fn pair(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Built-in decoders ────────────────────────────────────────────────────────

/// `IDROU<<SURNAME<<GIVEN<NAMES<<<` → `last_name`, `first_name`.
pub struct FullNameDecoder;

impl FullNameDecoder {
    const PREFIX_LEN: usize = 5;
    const FILLER: char = '<';
}

impl FieldDecoder for FullNameDecoder {
    fn decode(&self, raw: &str) -> Result<DecodedFields, ParseError> {
        // Partial reads no longer than the prefix are kept whole.
        let rest: String = if raw.chars().count() > Self::PREFIX_LEN {
            raw.chars().skip(Self::PREFIX_LEN).collect()
        } else {
            raw.to_string()
        };

        let (last_name, first_name) = match rest.find(Self::FILLER) {
            None => (rest.trim().to_string(), String::new()),
            Some(pos) => {
                let given = rest[pos..].replace(Self::FILLER, "-");
                (rest[..pos].trim().to_string(), given.trim_matches('-').to_string())
            }
        };

        Ok(vec![pair("first_name", first_name), pair("last_name", last_name)])
    }
}

/// `" ab 123456 "` → `serie = "AB"`, `nr = "123456"`.
pub struct SerieNrDecoder;

impl FieldDecoder for SerieNrDecoder {
    fn decode(&self, raw: &str) -> Result<DecodedFields, ParseError> {
        let compact: String = raw.split_whitespace().collect::<String>().to_uppercase();
        let serie: String = compact.chars().take(2).collect();
        let nr: String = compact.chars().skip(2).collect();
        Ok(vec![pair("serie", serie), pair("nr", nr)])
    }
}

/// Rebuilds the 13-digit personal numeric code from the machine-readable line.
///
/// The sex marker picks the first digit and the two-digit birth year picks the
/// century: above `century_pivot` means 1900s (`1`/`2`), otherwise 2000s (`5`/`6`).
/// The pivot is not calendar-relative, so it has to move before births in 2021+
/// hold ID cards.
pub struct CnpDecoder {
    pub century_pivot: u32,
}

impl CnpDecoder {
    pub fn new(century_pivot: u32) -> Self {
        Self { century_pivot }
    }

    pub fn century_digit(&self, marker: char, year: u32) -> char {
        let born_1900s = year > self.century_pivot;
        match (marker, born_1900s) {
            ('M', true) => '1',
            ('M', false) => '5',
            (_, true) => '2',
            (_, false) => '6',
        }
    }
}

impl FieldDecoder for CnpDecoder {
    fn decode(&self, raw: &str) -> Result<DecodedFields, ParseError> {
        let chars: Vec<char> = raw.chars().collect();

        let mut markers = chars.iter().copied().filter(|c| matches!(c, 'M' | 'F'));
        let marker = markers
            .next()
            .ok_or_else(|| ParseError::MissingGenderMarker(raw.to_string()))?;
        if markers.next().is_some() {
            return Err(ParseError::AmbiguousGenderMarker(raw.to_string()));
        }

        let year_text: String = chars.iter().take(2).collect();
        if year_text.chars().count() != 2 || !year_text.chars().all(|c| c.is_ascii_digit()) {
            return Err(ParseError::InvalidYear(raw.to_string()));
        }
        let year: u32 = year_text
            .parse()
            .map_err(|_| ParseError::InvalidYear(raw.to_string()))?;

        let len = chars.len();
        let first_six: String = chars[..len.min(6)].iter().collect();
        let last_six: String = chars[len.saturating_sub(6)..].iter().collect();
        let padding: &[char] = if len > 12 { &chars[6..len - 6] } else { &[] };
        let expiration: String = padding[padding.len().saturating_sub(6)..].iter().collect();

        let cnp = format!("{}{first_six}{last_six}", self.century_digit(marker, year));
        Ok(vec![pair("cnp", cnp), pair("expiration_date", expiration)])
    }
}

/// Whitespace-collapsed text under a single key.
pub struct PassthroughDecoder {
    key: String,
}

impl PassthroughDecoder {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl FieldDecoder for PassthroughDecoder {
    fn decode(&self, raw: &str) -> Result<DecodedFields, ParseError> {
        Ok(vec![(self.key.clone(), collapse_whitespace(raw))])
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

pub struct DecoderRegistry {
    decoders: HashMap<String, Box<dyn FieldDecoder>>,
    policy: CollisionPolicy,
}

impl DecoderRegistry {
    /// No decoders: every field passes through under its own name.
    pub fn empty(policy: CollisionPolicy) -> Self {
        Self { decoders: HashMap::new(), policy }
    }

    pub fn with_defaults(century_pivot: u32, policy: CollisionPolicy) -> Self {
        let mut registry = Self::empty(policy);
        registry
            .register(names::FULL_NAME, FullNameDecoder)
            .register(names::SERIE_NR, SerieNrDecoder)
            .register(names::CNP, CnpDecoder::new(century_pivot))
            .register(names::PLACE_OF_BIRTH, PassthroughDecoder::new(names::PLACE_OF_BIRTH))
            .register(names::ADDRESS, PassthroughDecoder::new(names::ADDRESS));
        registry
    }

    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self::with_defaults(config.cnp_century_pivot, config.collision_policy)
    }

    /// Register (or replace) the decoder for `field`.
    pub fn register(
        &mut self,
        field: impl Into<String>,
        decoder: impl FieldDecoder + 'static,
    ) -> &mut Self {
        self.decoders.insert(field.into(), Box::new(decoder));
        self
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    pub fn decode_field(&self, field: &str, raw: &str) -> Result<DecodedFields, ParseError> {
        match self.decoders.get(field) {
            Some(decoder) => decoder.decode(raw),
            None => PassthroughDecoder::new(field).decode(raw),
        }
    }

    /// Decode `field` and merge its keys into `doc` under the collision policy.
    pub fn decode_into(
        &self,
        doc: &mut ParsedDocument,
        field: &str,
        raw: &str,
    ) -> Result<(), ParseError> {
        for (key, value) in self.decode_field(field, raw)? {
            if self.policy == CollisionPolicy::Reject && doc.contains_key(&key) {
                return Err(ParseError::KeyCollision { field: field.to_string(), key });
            }
            doc.insert(key, value);
        }
        Ok(())
    }

    /// Decode every field; any failure rejects the whole document.
    pub fn decode_all(&self, raw: &RawFieldText) -> Result<ParsedDocument, ParseError> {
        let mut doc = ParsedDocument::new();
        for (field, text) in raw.iter() {
            self.decode_into(&mut doc, field, text)?;
        }
        Ok(doc)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::from_config(&ProcessorConfig::default())
    }
}
