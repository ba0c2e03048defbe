use crate::prelude::*;
use crate::sermatec::decoder::FieldValue;

// Label {{{
/// Friendly side of a converter entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Label {
    Text(&'static str),
    Flag(bool),
}

impl Label {
    pub fn matches(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (Label::Text(a), FieldValue::Text(b)) => a.eq_ignore_ascii_case(b.trim()),
            (Label::Flag(a), FieldValue::Bool(b)) => a == b,
            (Label::Flag(a), FieldValue::Int(b)) => i64::from(*a) == *b,
            _ => false,
        }
    }
}

impl From<Label> for FieldValue {
    fn from(label: Label) -> Self {
        match label {
            Label::Text(s) => FieldValue::Text(s.to_string()),
            Label::Flag(b) => FieldValue::Bool(b),
        }
    }
} // }}}

// MapConverter {{{
/// Two-way table between raw codes and friendly values. Raw codes missing
/// from the table map to `default_friendly`; unknown friendly values map to
/// `default_raw`.
#[derive(Debug)]
pub struct MapConverter {
    entries: &'static [(i64, Label)],
    default_raw: i64,
    default_friendly: Label,
}

impl MapConverter {
    pub const fn new(entries: &'static [(i64, Label)], default_raw: i64, default_friendly: Label) -> Self {
        Self {
            entries,
            default_raw,
            default_friendly,
        }
    }

    pub fn to_friendly(&self, raw: i64) -> FieldValue {
        self.entries
            .iter()
            .find(|(code, _)| *code == raw)
            .map(|(_, label)| *label)
            .unwrap_or(self.default_friendly)
            .into()
    }

    pub fn from_friendly(&self, friendly: &FieldValue) -> i64 {
        self.entries
            .iter()
            .find(|(_, label)| label.matches(friendly))
            .map(|(code, _)| *code)
            .unwrap_or(self.default_raw)
    }

    /// Converts an already decoded value; anything that is not an integer
    /// has no entry in the table.
    pub fn convert(&self, value: &FieldValue) -> FieldValue {
        match value {
            FieldValue::Int(raw) => self.to_friendly(*raw),
            _ => self.default_friendly.into(),
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.entries.iter().map(|(_, label)| label)
    }
}

pub static BATTERY_STATUS: MapConverter = MapConverter::new(
    &[
        (0x0011, Label::Text("charging")),
        (0x0022, Label::Text("discharging")),
        (0x0033, Label::Text("stand-by")),
    ],
    0x0000,
    Label::Text("unknown"),
);

pub static OPERATING_MODE: MapConverter = MapConverter::new(
    &[
        (0x0001, Label::Text("General Mode")),
        (0x0002, Label::Text("Energy Storage Mode")),
        (0x0003, Label::Text("Micro-grid")),
        (0x0004, Label::Text("Peak-Valley")),
        (0x0005, Label::Text("AC Coupling")),
    ],
    0x0000,
    Label::Text("unknown"),
);

// only meaningful as the value of a 0x64 set command
pub static ON_OFF: MapConverter = MapConverter::new(
    &[(0x55, Label::Flag(true)), (0xaa, Label::Flag(false))],
    0x00,
    Label::Flag(false),
); // }}}

// SemanticKind {{{
/// Fields whose raw code carries a meaning, resolved once from the field's
/// original (untranslated) name when the descriptor is loaded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SemanticKind {
    BatteryStatus,
    OperatingMode,
}

impl SemanticKind {
    pub fn from_field_name(name: &str) -> Option<Self> {
        match name {
            "Charge and discharge status" => Some(SemanticKind::BatteryStatus),
            "Operating mode" => Some(SemanticKind::OperatingMode),
            _ => None,
        }
    }

    pub fn converter(self) -> &'static MapConverter {
        match self {
            SemanticKind::BatteryStatus => &BATTERY_STATUS,
            SemanticKind::OperatingMode => &OPERATING_MODE,
        }
    }
} // }}}

// Validators {{{
pub trait Validate {
    fn validate(&self, raw: i64) -> bool;
}

/// Accepts only raw values from a fixed list.
#[derive(Debug)]
pub struct EnumValidator {
    allowed: &'static [i64],
}

impl EnumValidator {
    pub const fn new(allowed: &'static [i64]) -> Self {
        Self { allowed }
    }
}

impl Validate for EnumValidator {
    fn validate(&self, raw: i64) -> bool {
        self.allowed.contains(&raw)
    }
} // }}}

// FriendlyType {{{
/// What shape a parameter's friendly value takes; lets text input from a
/// terminal be turned into the right value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FriendlyType {
    Int,
    Text,
    Bool,
}

impl FriendlyType {
    pub fn parse(self, input: &str) -> Result<FieldValue> {
        let input = input.trim();
        match self {
            FriendlyType::Text => Ok(FieldValue::Text(input.to_string())),
            FriendlyType::Int => input
                .parse::<i64>()
                .map(FieldValue::Int)
                .map_err(|_| Error::ValidationFailed {
                    parameter: "integer".to_string(),
                    value: input.to_string(),
                }),
            FriendlyType::Bool => match input.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Ok(FieldValue::Bool(true)),
                "0" | "false" | "off" | "no" => Ok(FieldValue::Bool(false)),
                _ => Err(Error::ValidationFailed {
                    parameter: "boolean".to_string(),
                    value: input.to_string(),
                }),
            },
        }
    }
} // }}}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_code_is_unknown() {
        assert_eq!(BATTERY_STATUS.to_friendly(0x22), FieldValue::Text("discharging".into()));
        assert_eq!(BATTERY_STATUS.to_friendly(0x99), FieldValue::Text("unknown".into()));
    }

    #[test]
    fn friendly_to_raw() {
        assert_eq!(OPERATING_MODE.from_friendly(&FieldValue::Text("peak-valley".into())), 4);
        assert_eq!(OPERATING_MODE.from_friendly(&FieldValue::Text("nonsense".into())), 0);
        assert_eq!(ON_OFF.from_friendly(&FieldValue::Bool(false)), 0xaa);
        assert_eq!(ON_OFF.from_friendly(&FieldValue::Int(1)), 0x55);
    }

    #[test]
    fn semantic_kind_by_original_name() {
        assert_eq!(
            SemanticKind::from_field_name("Operating mode"),
            Some(SemanticKind::OperatingMode)
        );
        assert_eq!(SemanticKind::from_field_name("operating_mode"), None);
    }

    #[test]
    fn enum_validator() {
        let v = EnumValidator::new(&[0x55, 0xaa]);
        assert!(v.validate(0x55));
        assert!(!v.validate(0));
    }

    #[test]
    fn friendly_type_parsing() {
        assert_eq!(FriendlyType::Bool.parse("On").unwrap(), FieldValue::Bool(true));
        assert_eq!(FriendlyType::Int.parse(" 42 ").unwrap(), FieldValue::Int(42));
        assert!(FriendlyType::Bool.parse("maybe").is_err());
    }
}
