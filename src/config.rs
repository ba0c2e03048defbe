use crate::prelude::*;

use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub inverter: Inverter,

    #[serde(default = "Config::default_protocol_file")]
    pub protocol_file: String,

    /// Optional `;`-separated file of display names for descriptor fields
    pub translation_file: Option<String>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Inverter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    pub host: String,
    #[serde(default = "Config::default_port")]
    pub port: u16,

    pub connect_timeout: Option<u64>,
    pub drain_timeout: Option<u64>,
    pub response_timeout: Option<u64>,
    pub attempts: Option<u32>,
    pub use_tcp_nodelay: Option<bool>,
    pub keepalive: Option<u64>,
}
impl Inverter {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connect_timeout(&self) -> u64 {
        self.connect_timeout.unwrap_or(3)
    }

    pub fn drain_timeout(&self) -> u64 {
        self.drain_timeout.unwrap_or(10)
    }

    pub fn response_timeout(&self) -> u64 {
        self.response_timeout.unwrap_or(20)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.unwrap_or(3)
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.use_tcp_nodelay.unwrap_or(true)
    }

    /// `keepalive: 0` turns TCP keepalive off.
    pub fn keepalive(&self) -> Option<Duration> {
        match self.keepalive.unwrap_or(60) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| Error::Config(format!("error reading {}: {}", file, err)))?;

        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Logs the effective settings, defaults included.
    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Inverter:");
        info!("    Host: {}", self.inverter.host);
        info!("    Port: {}", self.inverter.port);
        info!("    Connect Timeout: {}s", self.inverter.connect_timeout());
        info!("    Drain Timeout: {}s", self.inverter.drain_timeout());
        info!("    Response Timeout: {}s", self.inverter.response_timeout());
        info!("    Attempts: {}", self.inverter.attempts());
        info!("    TCP NoDelay: {}", self.inverter.use_tcp_nodelay());
        info!("    Keepalive: {}s", self.inverter.keepalive.unwrap_or(60));
        info!("  Protocol File: {}", self.protocol_file);
        info!(
            "  Translation File: {}",
            self.translation_file.as_deref().unwrap_or("none")
        );
        info!("  Log Level: {}", self.loglevel);
    }

    /// Configuration for a host given on the command line, all else default.
    pub fn for_host(host: &str) -> Self {
        Self {
            inverter: Inverter {
                host: host.to_string(),
                port: Self::default_port(),
                connect_timeout: None,
                drain_timeout: None,
                response_timeout: None,
                attempts: None,
                use_tcp_nodelay: None,
                keepalive: None,
            },
            protocol_file: Self::default_protocol_file(),
            translation_file: None,
            loglevel: Self::default_loglevel(),
        }
    }

    pub fn protocol_file(&self) -> &str {
        &self.protocol_file
    }

    pub fn translation_file(&self) -> Option<&str> {
        self.translation_file.as_deref()
    }

    pub fn loglevel(&self) -> &str {
        &self.loglevel
    }

    pub fn validate(&self) -> Result<()> {
        let inv = &self.inverter;

        if inv.host.is_empty() {
            return Err(Error::Config("inverter.host cannot be empty".to_string()));
        }
        if inv.port == 0 {
            return Err(Error::Config("inverter.port must be between 1 and 65535".to_string()));
        }
        if inv.attempts() == 0 {
            return Err(Error::Config("inverter.attempts must be at least 1".to_string()));
        }
        for (key, value) in [
            ("connect_timeout", inv.connect_timeout()),
            ("drain_timeout", inv.drain_timeout()),
            ("response_timeout", inv.response_timeout()),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("invalid inverter.{}: 0", key)));
            }
        }
        if self.protocol_file.is_empty() {
            return Err(Error::Config("protocol_file cannot be empty".to_string()));
        }

        Ok(())
    }

    fn default_port() -> u16 {
        8899
    }

    fn default_protocol_file() -> String {
        "protocol-en.json".to_string()
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
