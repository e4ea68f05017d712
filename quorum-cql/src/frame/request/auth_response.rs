use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, SerializableRequest,
};
use crate::frame::types;

/// Answer to an AUTHENTICATE or AUTH_CHALLENGE message.
#[derive(Debug)]
pub struct AuthResponse {
    pub response: Option<Vec<u8>>,
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;
    const COMPRESSIBLE: bool = false;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_bytes_opt(self.response.as_ref(), buf)?;
        Ok(())
    }
}

impl DeserializableRequest for AuthResponse {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let response = types::read_bytes_opt(buf)?.map(<[u8]>::to_vec);
        Ok(Self { response })
    }
}
