use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything the library can fail with.
///
/// Transport and integrity failures may clear up on a fresh attempt; schema,
/// decode and encode failures are deterministic for the same inputs. See
/// [`Error::is_retryable`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("not connected to the inverter")]
    NotConnected,

    #[error("timed out {0}")]
    Timeout(&'static str),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("reply to command 0x{0:02x} failed the integrity check")]
    IntegrityCheckFailed(u8),

    #[error("command {0} not found in protocol")]
    CommandNotFound(String),

    #[error("protocol descriptor malformed: {0}")]
    SchemaMalformed(String),

    #[error("unsupported field type '{0}'")]
    UnsupportedFieldType(String),

    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLong(usize),

    #[error("missing tagged value '{0}' for set payload")]
    MissingField(String),

    #[error("parameter '{0}' not found")]
    ParameterNotFound(String),

    #[error("value {value} is not allowed for parameter '{parameter}'")]
    ValidationFailed { parameter: String, value: String },

    #[error("malformed response: {0}")]
    ResponseMalformed(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a fresh attempt over the same connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::IntegrityCheckFailed(_))
    }

    pub(crate) fn command_code(code: u8) -> Self {
        Error::CommandNotFound(format!("0x{:02x}", code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(Error::Timeout("waiting for reply").is_retryable());
        assert!(Error::IntegrityCheckFailed(0x98).is_retryable());
        assert!(!Error::ConnectionClosed.is_retryable());
        assert!(!Error::NotConnected.is_retryable());
        assert!(!Error::command_code(0x42).is_retryable());
        assert!(!Error::MissingField("soc".into()).is_retryable());
    }

    #[test]
    fn command_code_renders_hex() {
        assert_eq!(
            Error::command_code(0x0a).to_string(),
            "command 0x0a not found in protocol"
        );
    }
}
