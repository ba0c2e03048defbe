use clap::Parser;

/// Sermatec Bridge - query and configure Sermatec solar inverters
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read; without one, HOST must be given
    #[clap(short = 'c', long = "config")]
    pub config_file: Option<String>,

    /// Inverter address, overrides the config file
    pub host: Option<String>,

    /// Inverter TCP port
    #[clap(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Dataset to query by name, e.g. batteryStatus (repeatable)
    #[clap(short = 'g', long = "get")]
    pub get: Vec<String>,

    /// Query a command by hex code, e.g. 0a
    #[clap(long = "custom", value_parser = parse_hex_code)]
    pub custom: Option<u8>,

    /// Print the validated reply frames of a command as hex
    #[clap(long = "raw", value_parser = parse_hex_code)]
    pub raw: Option<u8>,

    /// Set a parameter, e.g. operatingMode=Peak-Valley (repeatable)
    #[clap(long = "set", value_parser = parse_assignment)]
    pub set: Vec<(String, String)>,

    /// List the fields of every query command without reading values
    #[clap(long = "list")]
    pub list: bool,

    /// Protocol descriptor, overrides the config file
    #[clap(long = "protocol-file")]
    pub protocol_file: Option<String>,

    /// Debug logging
    #[clap(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}

pub fn parse_hex_code(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|_| format!("'{}' is not a one-byte hex code", s))
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("'{}' is not of the form name=value", s)),
    }
}
