//! Bound values of a statement, already encoded by the caller's type codec.
//!
//! The driver core never looks inside a value; it only frames the list.

use bytes::{BufMut, Bytes};

use crate::frame::frame_errors::{CqlRequestSerializationError, LowLevelDeserializationError};
use crate::frame::types;

/// One positional value as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Null,
    Unset,
    Value(Bytes),
}

/// An ordered list of encoded positional values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValues {
    values: Vec<RawValue>,
}

impl SerializedValues {
    /// A list with no values; statements without bind markers use this.
    pub const EMPTY: &'static SerializedValues = &SerializedValues::new();

    pub const fn new() -> Self {
        SerializedValues { values: Vec::new() }
    }

    pub fn add_value(&mut self, value: impl Into<Bytes>) {
        self.values.push(RawValue::Value(value.into()));
    }

    pub fn add_null(&mut self) {
        self.values.push(RawValue::Null);
    }

    pub fn add_unset(&mut self) {
        self.values.push(RawValue::Unset);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawValue> {
        self.values.iter()
    }

    /// Writes `[short n]` followed by n `[value]`s.
    pub fn write_to_request(&self, buf: &mut impl BufMut) -> Result<(), CqlRequestSerializationError> {
        types::write_short_length(self.values.len(), buf)
            .map_err(|_| CqlRequestSerializationError::TooManyValues(self.values.len()))?;
        for value in &self.values {
            match value {
                RawValue::Null => types::write_int(-1, buf),
                RawValue::Unset => types::write_int(-2, buf),
                RawValue::Value(v) => types::write_bytes(v, buf)?,
            }
        }
        Ok(())
    }

    pub fn new_from_frame(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let count = types::read_short(buf)?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = types::read_int(buf)?;
            let value = match len {
                -1 => RawValue::Null,
                -2 => RawValue::Unset,
                len if len >= 0 => RawValue::Value(Bytes::copy_from_slice(
                    types::read_raw_bytes(len as usize, buf)?,
                )),
                len => return Err(LowLevelDeserializationError::InvalidValueLength(len)),
            };
            values.push(value);
        }
        Ok(SerializedValues { values })
    }
}

impl<T: Into<Bytes>> FromIterator<T> for SerializedValues {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        SerializedValues {
            values: iter.into_iter().map(|v| RawValue::Value(v.into())).collect(),
        }
    }
}
