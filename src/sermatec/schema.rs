use crate::prelude::*;
use crate::sermatec::converter::SemanticKind;
use crate::sermatec::frame;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Short names accepted by `query`. `load` is kept for older callers and
/// answers with the BMS status.
const COMMAND_SHORT_NAMES: &[(&str, u8)] = &[
    ("systemInformation", 0x98),
    ("batteryStatus", 0x0a),
    ("gridPVStatus", 0x0b),
    ("runningStatus", 0x0c),
    ("workingParameters", 0x95),
    ("load", 0x0d),
    ("bmsStatus", 0x0d),
];

const ALL_QUERY_COMMANDS: &[u8] = &[0x98, 0x0a, 0x0b, 0x0c, 0x95, 0x0d];
// 0x9d is never requested, it only arrives as the second reply to 0x95
const ALL_RESPONSE_CODES: &[u8] = &[0x98, 0x0a, 0x0b, 0x0c, 0x95, 0x0d, 0x9d];

// widest window an integer field may declare
const MAX_NUMERIC_BYTES: usize = 8;

// raw descriptor {{{
#[derive(Debug, Deserialize)]
struct RawOsim {
    versions: Vec<RawVersion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVersion {
    version: u32,
    #[serde(default)]
    query_commands: Vec<String>,
    #[serde(default)]
    commands: Vec<RawCommand>,
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    #[serde(rename = "type")]
    code: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    fields: Vec<RawField>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawField {
    name: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    byte_len: i64,
    #[serde(rename = "type")]
    kind: String,
    unit_value: Option<serde_json::Value>,
    unit_type: Option<String>,
    device_class: Option<String>,
    bit_position: Option<u32>,
    from_bit: Option<u32>,
    end_bit: Option<u32>,
    #[serde(default)]
    same: bool,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    repeat: Option<usize>,
    tag: Option<String>,
    #[serde(default)]
    list_ignore: bool,
}
// }}}

// FieldKind {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
    SignedInt,
    UnsignedInt,
    LongUnsignedInt,
    Ascii,
    Bit { position: u32 },
    BitRange { from: u32, to: u32 },
    Hex,
    Reserved,
}

impl FieldKind {
    fn from_descriptor(field: &RawField) -> Result<Self> {
        let kind = match field.kind.as_str() {
            "int" => FieldKind::SignedInt,
            "uInt" => FieldKind::UnsignedInt,
            "long" => FieldKind::LongUnsignedInt,
            "string" => FieldKind::Ascii,
            "hex" => FieldKind::Hex,
            "preserve" => FieldKind::Reserved,
            "bit" => match field.bit_position {
                Some(position) => FieldKind::Bit { position },
                None => {
                    return Err(malformed(field, "type 'bit' without 'bitPosition'"));
                }
            },
            "bitRange" => match (field.from_bit, field.end_bit) {
                (Some(from), Some(to)) if from <= to => FieldKind::BitRange { from, to },
                (Some(_), Some(_)) => {
                    return Err(malformed(field, "'fromBit' is past 'endBit'"));
                }
                _ => {
                    return Err(malformed(field, "type 'bitRange' without 'fromBit' or 'endBit'"));
                }
            },
            other => return Err(Error::UnsupportedFieldType(other.to_string())),
        };

        Ok(kind)
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, FieldKind::Ascii | FieldKind::Reserved)
    }
} // }}}

// Multiplier {{{
/// Scale factor of a numeric field. The number of fractional digits in its
/// shortest decimal form fixes the rounding of decoded values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Multiplier {
    factor: f64,
    decimals: u32,
}

impl Default for Multiplier {
    fn default() -> Self {
        Self {
            factor: 1.0,
            decimals: 0,
        }
    }
}

impl Multiplier {
    pub fn new(factor: f64) -> Self {
        let text = factor.to_string();
        let decimals = text
            .split_once('.')
            .map(|(_, fraction)| fraction.len() as u32)
            .unwrap_or(0);

        Self { factor, decimals }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    fn from_descriptor(value: &serde_json::Value) -> Option<Self> {
        let factor = match value {
            serde_json::Value::Number(n) => n.as_f64()?,
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };

        factor.is_finite().then(|| Self::new(factor))
    }
} // }}}

// FieldSpec / CommandSchema {{{
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    /// Name as written in the descriptor.
    pub name: String,
    /// Normalized identifier derived from `name`; the key of decoded output.
    pub tag: String,
    /// Explicit tag used when reading back settable values.
    pub param_tag: Option<String>,
    pub byte_len: usize,
    pub kind: FieldKind,
    pub multiplier: Multiplier,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    pub same_offset: bool,
    pub repeat: Option<usize>,
    pub semantic: Option<SemanticKind>,
    pub list_ignore: bool,
}

impl FieldSpec {
    fn from_descriptor(field: RawField) -> Result<Self> {
        let kind = FieldKind::from_descriptor(&field)?;

        if field.byte_len < 1 {
            return Err(malformed(&field, "'byteLen' is zero or negative"));
        }
        let byte_len = field.byte_len as usize;

        if kind.is_numeric() && byte_len > MAX_NUMERIC_BYTES {
            return Err(malformed(&field, "numeric field wider than 8 bytes"));
        }
        if field.repeat.is_some_and(|repeat| byte_len.checked_mul(repeat).is_none()) {
            return Err(malformed(&field, "'repeat' overflows the field length"));
        }
        match kind {
            FieldKind::Bit { position } if position as usize >= byte_len * 8 => {
                return Err(malformed(&field, "'bitPosition' outside the field"));
            }
            FieldKind::BitRange { from, to } if (to - from) as usize > byte_len * 8 => {
                return Err(malformed(&field, "bit range wider than the field"));
            }
            _ => {}
        }

        let multiplier = match &field.unit_value {
            None => Multiplier::default(),
            Some(value) => Multiplier::from_descriptor(value)
                .ok_or_else(|| malformed(&field, "'unitValue' is not a number"))?,
        };

        Ok(Self {
            tag: tag_from_name(&field.name),
            semantic: SemanticKind::from_field_name(&field.name),
            param_tag: field.tag,
            byte_len,
            kind,
            multiplier,
            unit: field.unit_type,
            device_class: field.device_class,
            same_offset: field.same,
            repeat: field.repeat,
            list_ignore: field.list_ignore,
            name: field.name,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommandSchema {
    pub code: u8,
    pub comment: String,
    pub fields: Vec<FieldSpec>,
    /// Version entry that declared this layout.
    pub version: u32,
}

impl CommandSchema {
    pub fn field(&self, tag: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.tag == tag)
    }
} // }}}

struct ProtocolVersion {
    version: u32,
    query_commands: Vec<u8>,
    commands: Vec<CommandSchema>,
}

/// Parsed protocol descriptor with version-aware command lookup.
pub struct SchemaRegistry {
    // in declaration order
    versions: Vec<ProtocolVersion>,
    short_names: IndexMap<&'static str, u8>,
}

impl SchemaRegistry {
    /// Builds the registry from an already parsed descriptor document. Every
    /// field is checked here so a bad descriptor is rejected before any query.
    pub fn load(descriptor: &serde_json::Value) -> Result<Self> {
        let osim = descriptor.get("osim").ok_or_else(|| {
            error!("protocol descriptor has no 'osim' key");
            Error::SchemaMalformed("'osim' key not found".to_string())
        })?;

        let raw: RawOsim = serde_json::from_value(osim.clone())
            .map_err(|e| Error::SchemaMalformed(e.to_string()))?;

        let mut versions = Vec::with_capacity(raw.versions.len());
        for v in raw.versions {
            let query_commands = v
                .query_commands
                .iter()
                .map(|c| parse_code(c))
                .collect::<Result<Vec<_>>>()?;

            let mut commands = Vec::with_capacity(v.commands.len());
            for c in v.commands {
                let code = parse_code(&c.code)?;
                let fields = c
                    .fields
                    .into_iter()
                    .map(FieldSpec::from_descriptor)
                    .collect::<Result<Vec<_>>>()?;

                commands.push(CommandSchema {
                    code,
                    comment: c.comment,
                    fields,
                    version: v.version,
                });
            }

            debug!(
                "protocol version {}: {} commands, {} query commands",
                v.version,
                commands.len(),
                query_commands.len()
            );

            versions.push(ProtocolVersion {
                version: v.version,
                query_commands,
                commands,
            });
        }

        Ok(Self {
            versions,
            short_names: COMMAND_SHORT_NAMES.iter().copied().collect(),
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let descriptor: serde_json::Value =
            serde_json::from_str(json).map_err(|e| Error::SchemaMalformed(e.to_string()))?;
        Self::load(&descriptor)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Reading protocol descriptor from {}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("error reading {}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }

    /// Newest layout of `code` among versions not above `version`. A later
    /// declaration replaces an earlier one as a whole; fields are never
    /// merged across versions.
    pub fn resolve_command(&self, code: u8, version: u32) -> Result<&CommandSchema> {
        let mut found = None;

        for v in self.versions.iter().filter(|v| v.version <= version) {
            if let Some(cmd) = v.commands.iter().find(|c| c.code == code) {
                found = Some(cmd);
            }
        }

        match found {
            Some(cmd) => {
                debug!(
                    "command 0x{:02x} resolved to version {} ({}, {} fields)",
                    code,
                    cmd.version,
                    cmd.comment,
                    cmd.fields.len()
                );
                Ok(cmd)
            }
            None => Err(Error::command_code(code)),
        }
    }

    pub fn code_from_short_name(&self, name: &str) -> Result<u8> {
        self.short_names.get(name).copied().ok_or_else(|| {
            error!("command '{}' not found", name);
            Error::CommandNotFound(name.to_string())
        })
    }

    pub fn short_names(&self) -> impl Iterator<Item = (&'static str, u8)> + '_ {
        self.short_names.iter().map(|(name, code)| (*name, *code))
    }

    /// Commands that may be requested from an inverter running `version`.
    pub fn query_commands(&self, version: u32) -> Vec<u8> {
        let mut codes: BTreeSet<u8> = ALL_QUERY_COMMANDS.iter().copied().collect();
        for v in self.versions.iter().filter(|v| v.version <= version) {
            codes.extend(v.query_commands.iter().copied());
        }
        codes.into_iter().collect()
    }

    pub fn response_codes(&self) -> &'static [u8] {
        ALL_RESPONSE_CODES
    }

    pub fn reply_codes(&self, request: u8) -> Vec<u8> {
        frame::reply_commands(request)
    }

    pub fn versions(&self) -> Vec<u32> {
        self.versions.iter().map(|v| v.version).collect()
    }
}

// Translations {{{
/// Display names for descriptor field names. Purely cosmetic.
#[derive(Clone, Debug, Default)]
pub struct Translations {
    names: HashMap<String, String>,
}

impl Translations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `original;translated` lines.
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut names = HashMap::new();
        for record in rdr.records() {
            let record = record.map_err(|e| Error::Config(format!("translation file: {}", e)))?;
            if let (Some(original), Some(translated)) = (record.get(0), record.get(1)) {
                names.insert(original.replace('"', ""), translated.replace('"', ""));
            }
        }

        debug!("loaded {} translations", names.len());
        Ok(Self { names })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Reading translations from {}", path.display());
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Config(format!("error reading {}: {}", path.display(), e)))?;
        Self::from_reader(file)
    }

    pub fn insert(&mut self, original: &str, translated: &str) {
        self.names.insert(original.to_string(), translated.to_string());
    }

    pub fn display_name<'a>(&'a self, original: &'a str) -> &'a str {
        self.names.get(original).map(String::as_str).unwrap_or(original)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
} // }}}

/// "Battery voltage (V)" -> "battery_voltage__v_"
pub fn tag_from_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn parse_code(code: &str) -> Result<u8> {
    let digits = code.trim().trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16)
        .map_err(|_| Error::SchemaMalformed(format!("invalid command code '{}'", code)))
}

fn malformed(field: &RawField, reason: &str) -> Error {
    error!("field '{}': {}", field.name, reason);
    Error::SchemaMalformed(format!("field '{}': {}", field.name, reason))
}
