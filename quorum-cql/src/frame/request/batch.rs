use std::borrow::Cow;

use bytes::{BufMut, Bytes};

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, SerializableRequest,
};
use crate::frame::types::{self, Consistency, SerialConsistency};
use crate::values::SerializedValues;

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;

/// The type of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

impl TryFrom<u8> for BatchType {
    type Error = RequestDeserializationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Logged),
            1 => Ok(Self::Unlogged),
            2 => Ok(Self::Counter),
            other => Err(RequestDeserializationError::UnknownBatchType(other)),
        }
    }
}

/// One statement of a batch: either text or a prepared id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatement<'a> {
    Query { text: Cow<'a, str> },
    Prepared { id: Bytes },
}

/// Executes several statements atomically.
#[derive(Debug, PartialEq, Eq)]
pub struct Batch<'b> {
    pub batch_type: BatchType,
    pub statements: Vec<(BatchStatement<'b>, Cow<'b, SerializedValues>)>,
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        buf.put_u8(self.batch_type as u8);

        types::write_short_length(self.statements.len(), buf)
            .map_err(|_| CqlRequestSerializationError::TooManyStatements(self.statements.len()))?;
        for (statement, values) in &self.statements {
            match statement {
                BatchStatement::Query { text } => {
                    buf.put_u8(0);
                    types::write_long_string(text, buf)?;
                }
                BatchStatement::Prepared { id } => {
                    buf.put_u8(1);
                    types::write_short_bytes(id, buf)?;
                }
            }
            // Every statement carries a value list, possibly empty.
            values.write_to_request(buf)?;
        }

        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }
        buf.put_u8(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

impl DeserializableRequest for Batch<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let batch_type = BatchType::try_from(types::read_raw_bytes(1, buf)?[0])?;

        let count = types::read_short(buf)?;
        let mut statements = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let statement = match types::read_raw_bytes(1, buf)?[0] {
                0 => BatchStatement::Query {
                    text: types::read_long_string(buf)?.to_owned().into(),
                },
                1 => BatchStatement::Prepared {
                    id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
                },
                other => {
                    return Err(RequestDeserializationError::UnexpectedBatchStatementKind(
                        other,
                    ))
                }
            };
            let values = SerializedValues::new_from_frame(buf)?;
            statements.push((statement, Cow::Owned(values)));
        }

        let consistency = types::read_consistency(buf)?;
        let flags = types::read_raw_bytes(1, buf)?[0];
        let serial_consistency = if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
            let c = types::read_consistency(buf)?;
            Some(
                SerialConsistency::try_from(c)
                    .map_err(|_| RequestDeserializationError::ExpectedSerialConsistency(c))?,
            )
        } else {
            None
        };
        let timestamp = (flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0)
            .then(|| types::read_long(buf))
            .transpose()?;

        Ok(Self {
            batch_type,
            statements,
            consistency,
            serial_consistency,
            timestamp,
        })
    }
}
