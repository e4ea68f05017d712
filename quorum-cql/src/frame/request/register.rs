use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, SerializableRequest,
};
use crate::frame::response::event::EventType;
use crate::frame::types;

/// Subscribes the connection to server-pushed events.
#[derive(Debug)]
pub struct Register {
    pub event_types_to_register_for: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        let names: Vec<&str> = self
            .event_types_to_register_for
            .iter()
            .map(EventType::as_str)
            .collect();
        types::write_string_list(&names, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Register {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        // Unknown event names are dropped, a server would reject them anyway.
        let event_types_to_register_for = types::read_string_list(buf)?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        Ok(Self {
            event_types_to_register_for,
        })
    }
}
