use crate::prelude::*;
use crate::sermatec::frame::{self, HEADER_LEN};
use crate::sermatec::schema::{CommandSchema, FieldKind, FieldSpec, Multiplier, SchemaRegistry, Translations};

use indexmap::IndexMap;
use serde::Serialize;

/// Payload data starts right after the frame header.
pub const REPLY_OFFSET_DATA: usize = HEADER_LEN;

// FieldValue {{{
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            FieldValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
} // }}}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParsedField {
    #[serde(skip)]
    pub tag: String,
    /// Display name, translated when a translation exists.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    /// Numeric value before semantic conversion; only set for converted fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<FieldValue>,
    /// Absent in dry-run output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<FieldValue>,
    #[serde(rename = "listIgnore")]
    pub list_ignore: bool,
}

pub type Fields = IndexMap<String, ParsedField>;

/// Raw byte windows keyed by explicit field tag.
pub type TaggedValues = IndexMap<String, Vec<u8>>;

pub struct FieldDecoder<'a> {
    registry: &'a SchemaRegistry,
    translations: &'a Translations,
}

impl<'a> FieldDecoder<'a> {
    pub fn new(registry: &'a SchemaRegistry, translations: &'a Translations) -> Self {
        Self {
            registry,
            translations,
        }
    }

    /// Resolves the layout of `code` for `version` and decodes `reply` with it.
    pub fn parse_reply(&self, code: u8, version: u32, reply: &[u8], dry_run: bool) -> Result<Fields> {
        let schema = self.registry.resolve_command(code, version)?;
        Ok(self.decode(schema, reply, dry_run))
    }

    /// Walks the fields of `schema` over the whole reply frame `reply`.
    ///
    /// Field kinds were checked when the descriptor was loaded, so decoding
    /// itself can not fail; windows that run past the payload are skipped.
    pub fn decode(&self, schema: &CommandSchema, reply: &[u8], dry_run: bool) -> Fields {
        if !dry_run {
            debug!("decoding 0x{:02x}: {}", schema.code, frame::hex(frame::payload(reply)));
        }

        let payload_end = HEADER_LEN + frame::payload(reply).len();
        let mut r = Fields::new();

        for (idx, window) in Cursor::new(&schema.fields).enumerate() {
            let field = window.field;
            trace!("field #{} '{}' at byte {}", idx, field.name, window.start);

            if window.skipped {
                continue;
            }

            let mut parsed = self.metadata(field);

            if !dry_run {
                let end = window.start + field.byte_len;
                if end > payload_end {
                    warn!(
                        "field '{}' ({}..{}) is outside the {} byte reply to 0x{:02x}, skipping",
                        field.name,
                        window.start,
                        end,
                        reply.len(),
                        schema.code
                    );
                    continue;
                }

                let value = decode_value(field, &reply[window.start..end]);
                match field.semantic {
                    Some(kind) => {
                        parsed.value = Some(kind.converter().convert(&value));
                        parsed.raw = Some(value);
                    }
                    None => parsed.value = Some(value),
                }
            }

            r.insert(field.tag.clone(), parsed);
        }

        r
    }

    /// Raw windows keyed by each field's explicit `tag`; fields without a
    /// tag, reserved and repeated fields are left out.
    pub fn parse_parameter_reply(&self, code: u8, version: u32, reply: &[u8]) -> Result<TaggedValues> {
        let schema = self.registry.resolve_command(code, version)?;
        let payload_end = HEADER_LEN + frame::payload(reply).len();
        let mut r = TaggedValues::new();

        for window in Cursor::new(&schema.fields) {
            let field = window.field;
            let tag = match (&field.param_tag, window.skipped) {
                (Some(tag), false) => tag,
                _ => continue,
            };

            let end = window.start + field.byte_len;
            if end > payload_end {
                warn!("tagged field '{}' is outside the reply, skipping", tag);
                continue;
            }

            let data = reply[window.start..end].to_vec();
            debug!("stored {} to tag {}", frame::hex(&data), tag);
            r.insert(tag.clone(), data);
        }

        Ok(r)
    }

    fn metadata(&self, field: &FieldSpec) -> ParsedField {
        let unit = match (&field.unit, field.kind) {
            (Some(unit), _) => Some(unit.clone()),
            (None, FieldKind::Bit { .. }) => Some("binary".to_string()),
            (None, _) => None,
        };

        let device_class = field
            .device_class
            .clone()
            .or_else(|| field.unit.as_deref().and_then(device_class_for_unit).map(str::to_string));

        ParsedField {
            tag: field.tag.clone(),
            name: self.translations.display_name(&field.name).to_string(),
            unit,
            device_class,
            raw: None,
            value: None,
            list_ignore: field.list_ignore,
        }
    }
}

// Cursor {{{
struct Window<'f> {
    field: &'f FieldSpec,
    start: usize,
    /// Repeated and reserved fields only move the cursor.
    skipped: bool,
}

/// Yields the byte offset of every field, honouring `same` and `repeat`.
struct Cursor<'f> {
    fields: std::slice::Iter<'f, FieldSpec>,
    position: usize,
    previous: usize,
}

impl<'f> Cursor<'f> {
    fn new(fields: &'f [FieldSpec]) -> Self {
        Self {
            fields: fields.iter(),
            position: REPLY_OFFSET_DATA,
            previous: REPLY_OFFSET_DATA,
        }
    }
}

impl<'f> Iterator for Cursor<'f> {
    type Item = Window<'f>;

    fn next(&mut self) -> Option<Self::Item> {
        let field = self.fields.next()?;

        if field.same_offset {
            self.position = self.previous;
        }
        let start = self.position;

        let mut advance = field.byte_len;
        if let Some(repeat) = field.repeat {
            advance = advance.saturating_mul(repeat);
        }

        self.previous = start;
        self.position = start.saturating_add(advance);

        Some(Window {
            field,
            start,
            skipped: field.repeat.is_some() || field.kind == FieldKind::Reserved,
        })
    }
} // }}}

fn decode_value(field: &FieldSpec, data: &[u8]) -> FieldValue {
    match field.kind {
        FieldKind::SignedInt => scale(be_signed(data), field.multiplier),
        FieldKind::UnsignedInt | FieldKind::LongUnsignedInt => scale(be_unsigned(data) as i128, field.multiplier),
        FieldKind::Hex => match i64::try_from(be_unsigned(data)) {
            Ok(v) => FieldValue::Int(v),
            Err(_) => FieldValue::Float(be_unsigned(data) as f64),
        },
        FieldKind::Ascii => {
            let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
            let text = &data[..end];
            if !text.is_ascii() {
                warn!("field '{}' holds non-ASCII bytes: {}", field.name, frame::hex(text));
            }
            FieldValue::Text(String::from_utf8_lossy(text).into_owned())
        }
        FieldKind::Bit { position } => FieldValue::Bool(be_unsigned(data) & (1 << position) != 0),
        FieldKind::BitRange { from, to } => {
            let width = (to - from) as usize;
            let raw = be_unsigned(data) as u128;
            let mask = (1u128 << width) - 1;
            let bits = (raw >> width) & mask;
            FieldValue::Text(format!("{:0width$b}", bits, width = width))
        }
        // never decoded
        FieldKind::Reserved => FieldValue::Int(0),
    }
}

/// Applies the multiplier and rounds to its number of decimals.
fn scale(raw: i128, multiplier: Multiplier) -> FieldValue {
    if multiplier.factor() == 1.0 {
        if let Ok(v) = i64::try_from(raw) {
            return FieldValue::Int(v);
        }
    }

    let v = raw as f64 * multiplier.factor();
    match multiplier.decimals() {
        // past i64::MAX an integer would saturate
        0 if v.round() >= i64::MAX as f64 || v.round() < i64::MIN as f64 => FieldValue::Float(v.round()),
        0 => FieldValue::Int(v.round() as i64),
        d => {
            let p = 10f64.powi(d as i32);
            FieldValue::Float((v * p).round() / p)
        }
    }
}

fn be_unsigned(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn be_signed(data: &[u8]) -> i128 {
    if data.is_empty() {
        return 0;
    }
    let bits = data.len() * 8;
    let raw = be_unsigned(data) as i128;
    if data[0] & 0x80 != 0 {
        raw - (1i128 << bits)
    } else {
        raw
    }
}

fn device_class_for_unit(unit: &str) -> Option<&'static str> {
    match unit {
        "V" => Some("VOLTAGE"),
        "W" => Some("POWER"),
        "VA" => Some("APPARENT_POWER"),
        "A" => Some("CURRENT"),
        "var" => Some("REACTIVE_POWER"),
        "°C" => Some("TEMPERATURE"),
        "Hz" => Some("FREQUENCY"),
        _ => None,
    }
}

/// 123 -> "1.2.3"
pub fn render_version(version: u32) -> String {
    format!("{}.{}.{}", version / 100, (version / 10) % 10, version % 10)
}
