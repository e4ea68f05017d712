//! Frame-level pieces of the native protocol: headers, compression and body extensions.

pub mod frame_errors;
pub mod request;
pub mod response;
pub mod types;

use bytes::{Buf, BufMut, Bytes};
use frame_errors::{
    CqlRequestSerializationError, DecompressionError, FrameBodyExtensionsParseError,
    FrameHeaderParseError,
};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use request::SerializableRequest;
use response::ResponseOpcode;

/// Size of the v3/v4 frame header.
pub const HEADER_SIZE: usize = 9;

/// Bodies larger than this are rejected before any allocation happens.
pub const MAX_FRAME_BODY_SIZE: usize = 256 * 1024 * 1024;

// Frame flags
const FLAG_COMPRESSION: u8 = 0x01;
const FLAG_TRACING: u8 = 0x02;
const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
const FLAG_WARNING: u8 = 0x08;

const RESPONSE_DIRECTION_BIT: u8 = 0x80;

/// Stream id the server uses for pushed events.
pub const EVENT_STREAM_ID: i16 = -1;

/// Native protocol versions understood by the driver.
///
/// Both use two-byte stream ids and share the same header layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ProtocolVersion {
    V3,
    #[default]
    V4,
}

impl ProtocolVersion {
    /// Version byte as it appears in a request header.
    pub fn as_byte(self) -> u8 {
        match self {
            ProtocolVersion::V3 => 0x03,
            ProtocolVersion::V4 => 0x04,
        }
    }

    /// The next version to try if the server rejects this one.
    pub fn downgrade(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => None,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = FrameHeaderParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(ProtocolVersion::V3),
            0x04 => Ok(ProtocolVersion::V4),
            other => Err(FrameHeaderParseError::VersionNotSupported(other)),
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    /// Name used in the STARTUP options and in the SUPPORTED response.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request frame, complete except for its stream id which is
/// filled in when the request is handed to a connection.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        match compression {
            Some(compression) if R::COMPRESSIBLE => {
                flags |= FLAG_COMPRESSION;
                let mut body = Vec::new();
                req.serialize(&mut body)?;
                compress_append(&body, compression, &mut data)?;
            }
            _ => req.serialize(&mut data)?,
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = version.as_byte();
        data[1] = flags;
        // Bytes 2..4 hold the stream id, see `set_stream`.
        data[4] = R::OPCODE as u8;

        let body_len = u32::try_from(data.len() - HEADER_SIZE)?;
        data[5..9].copy_from_slice(&body_len.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V4.as_byte(),
            flags: 0x00,
            stream: 0,
        }
    }
}

impl FrameParams {
    /// Protocol version with the direction bit masked off.
    pub fn protocol_version(&self) -> u8 {
        self.version & !RESPONSE_DIRECTION_BIT
    }
}

/// Reads one response frame: the header, then exactly `length` bytes of body.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameHeaderParseError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut raw_header[..])
        .await
        .map_err(|err| FrameHeaderParseError::HeaderIoError(Arc::new(err)))?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version & RESPONSE_DIRECTION_BIT == 0 {
        return Err(FrameHeaderParseError::FrameFromClient);
    }
    ProtocolVersion::try_from(version & !RESPONSE_DIRECTION_BIT)?;

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())?;

    let length = buf.get_u32() as usize;
    if length > MAX_FRAME_BODY_SIZE {
        return Err(FrameHeaderParseError::FrameTooLarge(
            length,
            MAX_FRAME_BODY_SIZE,
        ));
    }

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader
            .read_buf(&mut raw_body)
            .await
            .map_err(|err| FrameHeaderParseError::BodyIoError(Arc::new(err)))?;
        if n == 0 {
            // EOF, too early
            return Err(FrameHeaderParseError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// A response body with the optional prefix sections stripped off.
#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameBodyExtensionsParseError> {
    if flags & FLAG_COMPRESSION != 0 {
        let compression =
            compression.ok_or(FrameBodyExtensionsParseError::NoCompressionNegotiated)?;
        body = decompress(&body, compression)?.into();
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id =
            types::read_uuid(buf).map_err(FrameBodyExtensionsParseError::TraceIdParse)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)
            .map_err(FrameBodyExtensionsParseError::WarningsListParse)?;
        let rest_len = buf.len();
        body.advance(body.len() - rest_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let buf = &mut &*body;
        let payload = types::read_bytes_map(buf)
            .map_err(FrameBodyExtensionsParseError::CustomPayloadMapParse)?;
        let rest_len = buf.len();
        body.advance(body.len() - rest_len);
        Some(payload)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

/// Compresses `uncomp_body` and appends the result to `out`.
pub fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), CqlRequestSerializationError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = u32::try_from(uncomp_body.len())?;
            let compressed = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + compressed.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&compressed);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size =
                snap::raw::Encoder::new().compress(uncomp_body, &mut out[old_size..])?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

pub fn decompress(
    mut comp_body: &[u8],
    compression: Compression,
) -> Result<Vec<u8>, DecompressionError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(DecompressionError::Lz4MissingLength);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            lz4_flex::decompress(comp_body, uncomp_len)
                .map_err(|err| DecompressionError::Lz4(Arc::new(err)))
        }
        Compression::Snappy => Ok(snap::raw::Decoder::new().decompress_vec(comp_body)?),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discriminant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}
