//! Troupe Core - Types, wire events, and error handling

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{Error, ErrorClass, Result};
pub use protocol::*;
pub use types::*;
