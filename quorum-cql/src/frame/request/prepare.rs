use std::borrow::Cow;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, SerializableRequest,
};
use crate::frame::types;

#[derive(Debug)]
pub struct Prepare<'a> {
    pub query: Cow<'a, str>,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.query, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Prepare<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let query = types::read_long_string(buf)?.to_owned().into();
        Ok(Self { query })
    }
}
