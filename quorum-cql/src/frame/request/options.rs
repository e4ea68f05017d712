use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};

/// Asks the server which STARTUP options it supports.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;
    const COMPRESSIBLE: bool = false;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        Ok(())
    }
}

/* Key names for options in SUPPORTED/STARTUP */
pub const COMPRESSION: &str = "COMPRESSION";
pub const CQL_VERSION: &str = "CQL_VERSION";
pub const DRIVER_NAME: &str = "DRIVER_NAME";
pub const DRIVER_VERSION: &str = "DRIVER_VERSION";

/* Value names for options in SUPPORTED/STARTUP */
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";
pub const DEFAULT_DRIVER_NAME: &str = "quorum";
pub const DEFAULT_DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
