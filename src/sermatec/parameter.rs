use crate::prelude::*;
use crate::sermatec::converter::{EnumValidator, FriendlyType, MapConverter, Validate, ON_OFF, OPERATING_MODE};
use crate::sermatec::decoder::{FieldValue, TaggedValues};
use crate::sermatec::frame::KnownCommand;

/// A value that can be written to the inverter.
#[derive(Debug)]
pub struct SermatecParameter {
    pub name: &'static str,
    pub command: KnownCommand,
    pub byte_len: usize,
    pub converter: &'static MapConverter,
    pub validator: EnumValidator,
    pub friendly_type: FriendlyType,
}

static PARAMETERS: &[SermatecParameter] = &[
    SermatecParameter {
        name: "onOff",
        command: KnownCommand::SetOnOff,
        byte_len: 1,
        converter: &ON_OFF,
        validator: EnumValidator::new(&[0x55, 0xaa]),
        friendly_type: FriendlyType::Bool,
    },
    SermatecParameter {
        name: "operatingMode",
        command: KnownCommand::SetWorkingParameters,
        byte_len: 2,
        converter: &OPERATING_MODE,
        validator: EnumValidator::new(&[1, 2, 3, 4, 5]),
        friendly_type: FriendlyType::Text,
    },
];

pub fn parameters() -> &'static [SermatecParameter] {
    PARAMETERS
}

pub fn parameter_info(name: &str) -> Result<&'static SermatecParameter> {
    PARAMETERS.iter().find(|p| p.name == name).ok_or_else(|| {
        error!("parameter '{}' not found", name);
        Error::ParameterNotFound(name.to_string())
    })
}

impl SermatecParameter {
    /// Friendly value to the big-endian bytes written on the wire.
    pub fn encode(&self, friendly: &FieldValue) -> Result<Vec<u8>> {
        let raw = self.converter.from_friendly(friendly);

        if !self.validator.validate(raw) {
            warn!("value {} (raw 0x{:02x}) rejected for {}", friendly, raw, self.name);
            return Err(Error::ValidationFailed {
                parameter: self.name.to_string(),
                value: friendly.to_string(),
            });
        }

        let bytes = raw.to_be_bytes();
        Ok(bytes[bytes.len() - self.byte_len..].to_vec())
    }

    pub fn layout(&self) -> Result<&'static SetLayout> {
        let code = self.command.into();
        set_layout(code).ok_or_else(|| Error::command_code(code))
    }
}

// SetLayout {{{
/// Fixed payload shape of a set command.
#[derive(Debug)]
pub struct SetLayout {
    pub command: u8,
    pub tags: &'static [&'static str],
    pub trailer: &'static [u8],
    /// Query whose reply holds the current value of every tag.
    pub current_state_from: Option<u8>,
}

static SET_LAYOUTS: &[SetLayout] = &[
    SetLayout {
        command: 0x64,
        tags: &["onOff"],
        trailer: &[],
        current_state_from: None,
    },
    SetLayout {
        command: 0x66,
        tags: &[
            "price1",
            "price2",
            "price3",
            "price4",
            "con",
            "chargePower",
            "operatingMode",
            "gridSwitch",
            "adjustMethod",
            "refluxs",
            "batteryCharge",
            "soc",
        ],
        trailer: &[0x00, 0x00],
        current_state_from: Some(0x95),
    },
];

pub fn set_layout(command: u8) -> Option<&'static SetLayout> {
    SET_LAYOUTS.iter().find(|l| l.command == command)
}

/// Concatenates the tagged values `command` needs, in its fixed order.
pub fn build_set_payload(command: u8, tagged: &TaggedValues) -> Result<Vec<u8>> {
    let layout = set_layout(command).ok_or_else(|| Error::command_code(command))?;

    let mut r = Vec::new();
    for tag in layout.tags {
        let value = tagged.get(*tag).ok_or_else(|| {
            error!("missing value of '{}' for command 0x{:02x}", tag, command);
            Error::MissingField(tag.to_string())
        })?;
        r.extend_from_slice(value);
    }
    r.extend_from_slice(layout.trailer);

    Ok(r)
} // }}}
