//! Requests sent by the client.

pub mod auth_response;
pub mod batch;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use thiserror::Error;

pub use auth_response::AuthResponse;
pub use batch::Batch;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;

use super::frame_errors::{CqlRequestSerializationError, LowLevelDeserializationError};
use super::types::Consistency;
use super::TryFromPrimitiveError;

/// Opcode of a request, used to identify the request type in a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

impl std::fmt::Display for RequestOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RequestOpcode::Startup => "STARTUP",
            RequestOpcode::Options => "OPTIONS",
            RequestOpcode::Query => "QUERY",
            RequestOpcode::Prepare => "PREPARE",
            RequestOpcode::Execute => "EXECUTE",
            RequestOpcode::Register => "REGISTER",
            RequestOpcode::Batch => "BATCH",
            RequestOpcode::AuthResponse => "AUTH_RESPONSE",
        })
    }
}

/// Requests that can be serialized into a frame body.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    /// Whether the body may be compressed. Messages exchanged before
    /// compression is negotiated are never compressed.
    const COMPRESSIBLE: bool = true;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError>;
}

/// Requests that can be parsed back from a frame body.
///
/// The driver itself never needs this; test servers use it to inspect
/// what they were sent.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError>;
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RequestDeserializationError {
    #[error("Low level deser error: {0}")]
    LowLevelDeserialization(#[from] LowLevelDeserializationError),
    #[error("Specified flags are not recognised: {flags:02x}")]
    UnknownFlags { flags: u8 },
    #[error("Named values are not supported")]
    NamedValuesUnsupported,
    #[error("Expected serial consistency, got {0}")]
    ExpectedSerialConsistency(Consistency),
    #[error("Unknown batch type {0}")]
    UnknownBatchType(u8),
    #[error("Unexpected batch statement kind: {0}")]
    UnexpectedBatchStatementKind(u8),
    #[error("Request opcode {0} cannot be deserialized")]
    UnsupportedOpcode(RequestOpcode),
}

/// A parsed client request.
#[derive(Debug)]
#[non_exhaustive]
pub enum Request<'r> {
    Startup(Startup<'r>),
    Options,
    Query(Query<'r>),
    Prepare(Prepare<'r>),
    Execute(Execute<'r>),
    Batch(Batch<'r>),
    Register(Register),
    AuthResponse(AuthResponse),
}

impl Request<'_> {
    pub fn deserialize(
        buf: &mut &[u8],
        opcode: RequestOpcode,
    ) -> Result<Self, RequestDeserializationError> {
        Ok(match opcode {
            RequestOpcode::Startup => Request::Startup(Startup::deserialize(buf)?),
            RequestOpcode::Options => Request::Options,
            RequestOpcode::Query => Request::Query(Query::deserialize(buf)?),
            RequestOpcode::Prepare => Request::Prepare(Prepare::deserialize(buf)?),
            RequestOpcode::Execute => Request::Execute(Execute::deserialize(buf)?),
            RequestOpcode::Batch => Request::Batch(Batch::deserialize(buf)?),
            RequestOpcode::Register => Request::Register(Register::deserialize(buf)?),
            RequestOpcode::AuthResponse => {
                Request::AuthResponse(AuthResponse::deserialize(buf)?)
            }
        })
    }

    /// Consistency the request asks for, if it carries one.
    pub fn consistency(&self) -> Option<Consistency> {
        match self {
            Request::Query(q) => Some(q.parameters.consistency),
            Request::Execute(e) => Some(e.parameters.consistency),
            Request::Batch(b) => Some(b.consistency),
            _ => None,
        }
    }
}
