pub use log::{debug, error, info, trace, warn};

pub use crate::config::{self, Config};
pub use crate::error::{Error, Result};
pub use crate::options::Options;
pub use crate::sermatec::decoder::{FieldValue, Fields, ParsedField};
pub use crate::sermatec::inverter::{Connector, Inverter, RetryPolicy, TcpConnector};
pub use crate::sermatec::schema::{SchemaRegistry, Translations};
