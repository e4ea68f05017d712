//! Errors that may occur while framing, serializing or parsing protocol messages.

use std::sync::Arc;

use super::response::CqlResponseKind;
use super::TryFromPrimitiveError;
use thiserror::Error;

/// An error that occurred while reading a frame off the wire.
///
/// These errors are fatal to the connection they occur on.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameHeaderParseError {
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received a frame with protocol version {0}, but only 3 and 4 are supported")]
    VersionNotSupported(u8),
    #[error("Unrecognized response opcode {0}")]
    UnknownResponseOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Frame body of {0} bytes exceeds the maximum of {1} bytes")]
    FrameTooLarge(usize, usize),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Failed to read frame header: {0}")]
    HeaderIoError(Arc<std::io::Error>),
    #[error("Failed to read frame body: {0}")]
    BodyIoError(Arc<std::io::Error>),
}

/// An error that occurred while unpacking compression, tracing id,
/// warnings or custom payload from a response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameBodyExtensionsParseError {
    #[error("Frame is compressed, but no compression was negotiated for the connection")]
    NoCompressionNegotiated,
    #[error("Frame decompression failed: {0}")]
    Decompression(#[from] DecompressionError),
    #[error("Malformed trace id: {0}")]
    TraceIdParse(LowLevelDeserializationError),
    #[error("Malformed warnings list: {0}")]
    WarningsListParse(LowLevelDeserializationError),
    #[error("Malformed custom payload map: {0}")]
    CustomPayloadMapParse(LowLevelDeserializationError),
}

/// Decompression of a frame body failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DecompressionError {
    #[error("LZ4 body is too short to contain the uncompressed length")]
    Lz4MissingLength,
    #[error("LZ4 decompression failed: {0}")]
    Lz4(Arc<lz4_flex::block::DecompressError>),
    #[error("Snappy decompression failed: {0}")]
    Snappy(#[from] snap::Error),
}

/// An error that occurred while serializing a request into a frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    #[error("Value length does not fit the protocol length field")]
    LengthOverflow,
    #[error("Too many values in the request: {0}")]
    TooManyValues(usize),
    #[error("Too many statements in the batch: {0}")]
    TooManyStatements(usize),
    #[error("Snappy compression failed: {0}")]
    SnappyCompression(#[from] snap::Error),
}

impl From<std::num::TryFromIntError> for CqlRequestSerializationError {
    fn from(_: std::num::TryFromIntError) -> Self {
        CqlRequestSerializationError::LengthOverflow
    }
}

/// A response body could not be parsed.
#[derive(Error, Debug, Clone)]
#[error("Failed to deserialize {kind} response: {cause}")]
pub struct CqlResponseParseError {
    /// Which response the frame claimed to carry.
    pub kind: CqlResponseKind,
    /// What exactly went wrong.
    pub cause: ResponseParseCause,
}

/// The specific reason a response body failed to parse.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResponseParseCause {
    #[error("Malformed field `{field}`: {err}")]
    Field {
        field: &'static str,
        err: LowLevelDeserializationError,
    },
    #[error("Unknown result kind {0}")]
    UnknownResultKind(i32),
    #[error("Unknown {what}: {value}")]
    UnknownVariant { what: &'static str, value: String },
    #[error("Unexpected trailing data: {0} bytes")]
    TrailingBytes(usize),
}

impl ResponseParseCause {
    pub(crate) fn field(field: &'static str) -> impl FnOnce(LowLevelDeserializationError) -> Self {
        move |err| ResponseParseCause::Field { field, err }
    }
}

/// Low-level deserialization error, reported by the primitive readers in
/// [`types`](super::types).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}
