//! Primitive in-wire types of the native protocol: `[int]`, `[short]`,
//! `[string]`, `[bytes]`, maps, lists, `[consistency]` and `[inet]`.

use super::frame_errors::LowLevelDeserializationError;
use super::TryFromPrimitiveError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str;
use thiserror::Error;
use uuid::Uuid;

/// Consistency level of a request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    #[default]
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    LocalOne = 0x000A,
}

impl TryFrom<u16> for Consistency {
    type Error = TryFromPrimitiveError<u16>;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let c = match value {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000A => Consistency::LocalOne,
            _ => {
                return Err(TryFromPrimitiveError {
                    enum_name: "Consistency",
                    primitive: value,
                })
            }
        };
        Ok(c)
    }
}

impl Consistency {
    /// Whether this is one of the paxos consistencies.
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Consistency used for the paxos phase of lightweight transactions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

#[derive(Debug, Error)]
#[error("Expected Consistency Serial or LocalSerial, got: {0}")]
pub struct NonSerialConsistencyError(Consistency);

impl TryFrom<Consistency> for SerialConsistency {
    type Error = NonSerialConsistencyError;

    fn try_from(c: Consistency) -> Result<Self, Self::Error> {
        match c {
            Consistency::Serial => Ok(SerialConsistency::Serial),
            Consistency::LocalSerial => Ok(SerialConsistency::LocalSerial),
            other => Err(NonSerialConsistencyError(other)),
        }
    }
}

impl std::fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (head, rest) = buf.split_at(count);
    *buf = rest;
    Ok(head)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, LowLevelDeserializationError> {
    Ok(buf.read_i32::<BigEndian>()?)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    let len = read_int(buf)?;
    Ok(usize::try_from(len)?)
}

fn write_int_length(v: usize, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int(i32::try_from(v)?, buf);
    Ok(())
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, LowLevelDeserializationError> {
    Ok(buf.read_i64::<BigEndian>()?)
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, LowLevelDeserializationError> {
    Ok(buf.read_u16::<BigEndian>()?)
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

fn read_short_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    read_short(buf).map(usize::from)
}

pub(crate) fn write_short_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short(u16::try_from(v)?, buf);
    Ok(())
}

/// Reads `[bytes]`; a negative length is `null`.
pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    read_raw_bytes(len as usize, buf).map(Some)
}

/// Reads `[bytes]` that is not expected to be `null`.
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    match v {
        Some(bytes) => write_bytes(bytes.as_ref(), buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    Ok(str::from_utf8(read_raw_bytes(len, buf)?)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_bytes(v.as_bytes(), buf)
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    Ok(str::from_utf8(read_raw_bytes(len, buf)?)?)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_bytes(v.as_bytes(), buf)
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    (0..len)
        .map(|_| read_string(buf).map(str::to_owned))
        .collect()
}

pub fn write_string_list(
    v: &[impl AsRef<str>],
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for s in v {
        write_string(s.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut map = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        map.insert(key, val);
    }
    Ok(map)
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut map = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        map.insert(key, val);
    }
    Ok(map)
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v {
        write_string(key, buf)?;
        write_string_list(val, buf)?;
    }
    Ok(())
}

pub fn read_bytes_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, Bytes>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut map = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = Bytes::copy_from_slice(read_bytes(buf)?);
        map.insert(key, val);
    }
    Ok(map)
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    let raw = read_raw_bytes(16, buf)?;
    let mut arr = [0u8; 16];
    arr.copy_from_slice(raw);
    Ok(Uuid::from_bytes(arr))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(uuid.as_bytes());
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    let raw = read_short(buf)?;
    Ok(Consistency::try_from(raw)?)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let len = buf.read_u8()?;
    let ip = match len {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(read_raw_bytes(4, buf)?);
            IpAddr::from(octets)
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(read_raw_bytes(16, buf)?);
            IpAddr::from(octets)
        }
        other => return Err(LowLevelDeserializationError::InvalidInetLength(other)),
    };
    let port = read_int(buf)?;
    Ok(SocketAddr::new(ip, port as u16))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
    write_int(addr.port() as i32, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn strings_and_collections() {
        let mut buf = Vec::new();
        write_string("hello, world!", &mut buf).unwrap();
        write_long_string("", &mut buf).unwrap();
        write_string_list(&["CQL_VERSION", "COMPRESSION"], &mut buf).unwrap();

        let mut multimap = HashMap::new();
        multimap.insert("COMPRESSION".to_owned(), vec!["lz4".to_owned()]);
        multimap.insert("empty".to_owned(), vec![]);
        write_string_multimap(&multimap, &mut buf).unwrap();

        let mut rd = &buf[..];
        assert_eq!(read_string(&mut rd).unwrap(), "hello, world!");
        assert_eq!(read_long_string(&mut rd).unwrap(), "");
        assert_eq!(
            read_string_list(&mut rd).unwrap(),
            vec!["CQL_VERSION".to_owned(), "COMPRESSION".to_owned()]
        );
        assert_eq!(read_string_multimap(&mut rd).unwrap(), multimap);
        assert!(rd.is_empty());
    }

    #[test]
    fn null_and_short_bytes() {
        let mut buf = Vec::new();
        write_bytes_opt(None::<&[u8]>, &mut buf).unwrap();
        write_short_bytes(&[0xCA, 0xFE], &mut buf).unwrap();

        let mut rd = &buf[..];
        assert_eq!(read_bytes_opt(&mut rd).unwrap(), None);
        assert_eq!(read_short_bytes(&mut rd).unwrap(), &[0xCA, 0xFE]);
    }

    #[test]
    fn truncated_input_is_reported() {
        let mut buf = Vec::new();
        write_int(10, &mut buf);
        buf.extend_from_slice(&[1, 2, 3]);
        assert_matches!(
            read_bytes(&mut &buf[..]),
            Err(LowLevelDeserializationError::TooFewBytesReceived {
                expected: 10,
                received: 3
            })
        );
    }

    #[test]
    fn unknown_consistency_mentions_value() {
        let mut buf = Vec::new();
        write_short(0x1234, &mut buf);
        let err = read_consistency(&mut &buf[..]).unwrap_err();
        assert!(err.to_string().contains(&0x1234.to_string()));

        buf.clear();
        write_consistency(Consistency::LocalOne, &mut buf);
        assert_eq!(
            read_consistency(&mut &buf[..]).unwrap(),
            Consistency::LocalOne
        );
    }

    #[test]
    fn inet_both_families() {
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 9042);
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 19042);
        let mut buf = Vec::new();
        write_inet(v4, &mut buf);
        write_inet(v6, &mut buf);

        let mut rd = &buf[..];
        assert_eq!(read_inet(&mut rd).unwrap(), v4);
        assert_eq!(read_inet(&mut rd).unwrap(), v6);

        assert_matches!(
            read_inet(&mut &[5u8, 0, 0][..]),
            Err(LowLevelDeserializationError::InvalidInetLength(5))
        );
    }
}
