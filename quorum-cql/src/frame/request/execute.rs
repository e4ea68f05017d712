use bytes::Bytes;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, SerializableRequest,
};
use crate::frame::types;

/// Executes a prepared statement by its id.
#[derive(Debug, PartialEq, Eq)]
pub struct Execute<'a> {
    pub id: Bytes,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_short_bytes(&self.id, buf)?;
        self.parameters.serialize(buf)
    }
}

impl DeserializableRequest for Execute<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
        let parameters = QueryParameters::deserialize(buf)?;
        Ok(Self { id, parameters })
    }
}
