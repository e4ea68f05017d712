//! EVENT responses pushed by the server on stream -1.

use crate::frame::frame_errors::ResponseParseCause;
use crate::frame::types;
use std::net::SocketAddr;
use std::str::FromStr;

/// Kinds of events a connection may REGISTER for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        }
    }
}

impl FromStr for EventType {
    type Err = ResponseParseCause;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(EventType::TopologyChange),
            "STATUS_CHANGE" => Ok(EventType::StatusChange),
            "SCHEMA_CHANGE" => Ok(EventType::SchemaChange),
            other => Err(unknown("event type", other)),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unknown(what: &'static str, value: &str) -> ResponseParseCause {
    ResponseParseCause::UnknownVariant {
        what,
        value: value.to_owned(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

/// What a schema change touched.
///
/// The same body shape is used both by SCHEMA_CHANGE events and by
/// RESULT::SchemaChange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table { name: String },
    Type { name: String },
    Function { name: String, arguments: Vec<String> },
    Aggregate { name: String, arguments: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub keyspace_name: String,
    pub target: SchemaChangeTarget,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseCause> {
        let event_type: EventType = types::read_string(buf)
            .map_err(ResponseParseCause::field("event_type"))?
            .parse()?;
        match event_type {
            EventType::TopologyChange => {
                TopologyChangeEvent::deserialize(buf).map(Event::TopologyChange)
            }
            EventType::StatusChange => StatusChangeEvent::deserialize(buf).map(Event::StatusChange),
            EventType::SchemaChange => SchemaChangeEvent::deserialize(buf).map(Event::SchemaChange),
        }
    }
}

impl TopologyChangeEvent {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseCause> {
        let change = types::read_string(buf).map_err(ResponseParseCause::field("change"))?;
        let addr = types::read_inet(buf).map_err(ResponseParseCause::field("address"))?;
        match change {
            "NEW_NODE" => Ok(TopologyChangeEvent::NewNode(addr)),
            "REMOVED_NODE" => Ok(TopologyChangeEvent::RemovedNode(addr)),
            other => Err(unknown("topology change", other)),
        }
    }
}

impl StatusChangeEvent {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseCause> {
        let status = types::read_string(buf).map_err(ResponseParseCause::field("status"))?;
        let addr = types::read_inet(buf).map_err(ResponseParseCause::field("address"))?;
        match status {
            "UP" => Ok(StatusChangeEvent::Up(addr)),
            "DOWN" => Ok(StatusChangeEvent::Down(addr)),
            other => Err(unknown("status change", other)),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseCause> {
        let change_type = match types::read_string(buf)
            .map_err(ResponseParseCause::field("change_type"))?
        {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            other => return Err(unknown("schema change type", other)),
        };
        let target = types::read_string(buf)
            .map_err(ResponseParseCause::field("target"))?
            .to_owned();
        let keyspace_name = types::read_string(buf)
            .map_err(ResponseParseCause::field("keyspace"))?
            .to_owned();

        let mut name = || -> Result<String, ResponseParseCause> {
            types::read_string(buf)
                .map(str::to_owned)
                .map_err(ResponseParseCause::field("name"))
        };
        let target = match target.as_str() {
            "KEYSPACE" => SchemaChangeTarget::Keyspace,
            "TABLE" => SchemaChangeTarget::Table { name: name()? },
            "TYPE" => SchemaChangeTarget::Type { name: name()? },
            "FUNCTION" | "AGGREGATE" => {
                let name = name()?;
                let arguments = types::read_string_list(buf)
                    .map_err(ResponseParseCause::field("arguments"))?;
                if target == "FUNCTION" {
                    SchemaChangeTarget::Function { name, arguments }
                } else {
                    SchemaChangeTarget::Aggregate { name, arguments }
                }
            }
            other => return Err(unknown("schema change target", other)),
        };

        Ok(SchemaChangeEvent {
            change_type,
            keyspace_name,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn status_and_schema_events() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), 9042);
        let mut buf = Vec::new();
        types::write_string("STATUS_CHANGE", &mut buf).unwrap();
        types::write_string("DOWN", &mut buf).unwrap();
        types::write_inet(addr, &mut buf);
        assert_eq!(
            Event::deserialize(&mut &buf[..]).unwrap(),
            Event::StatusChange(StatusChangeEvent::Down(addr))
        );

        buf.clear();
        types::write_string("SCHEMA_CHANGE", &mut buf).unwrap();
        types::write_string("CREATED", &mut buf).unwrap();
        types::write_string("FUNCTION", &mut buf).unwrap();
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("add", &mut buf).unwrap();
        types::write_string_list(&["int", "int"], &mut buf).unwrap();
        assert_eq!(
            Event::deserialize(&mut &buf[..]).unwrap(),
            Event::SchemaChange(SchemaChangeEvent {
                change_type: SchemaChangeType::Created,
                keyspace_name: "ks".to_owned(),
                target: SchemaChangeTarget::Function {
                    name: "add".to_owned(),
                    arguments: vec!["int".to_owned(), "int".to_owned()],
                },
            })
        );
    }
}
