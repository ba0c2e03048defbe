pub mod config;
pub mod error;
pub mod options;
pub mod prelude;
pub mod sermatec;

pub use crate::error::{Error, Result};

pub const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
