//! RESULT responses.
//!
//! Row contents are left encoded: the driver core only needs the column
//! specs, the row count and the paging state. Decoding values is the job
//! of the caller's type codec.

use crate::frame::frame_errors::{LowLevelDeserializationError, ResponseParseCause};
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use bytes::Bytes;

// Rows metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

/// Id of a freshly prepared statement, plus its metadata left encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub id: Bytes,
    pub raw_metadata: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

/// Type of a column, as far as needed to walk the metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    /// One of the fixed protocol type ids (ascii, bigint, blob, ...).
    Native(u16),
    List(Box<ColumnType>),
    Set(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    UserDefinedType {
        keyspace: String,
        name: String,
        fields: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    /// Empty when the request asked to skip metadata.
    pub col_specs: Vec<ColumnSpec>,
}

/// A page of rows whose values are still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRows {
    pub metadata: ResultMetadata,
    /// Present iff the server has more pages for this request.
    pub paging_state: Option<Bytes>,
    pub rows_count: usize,
    pub raw_rows: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Result {
    Void,
    Rows(RawRows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn field<T>(
    res: std::result::Result<T, LowLevelDeserializationError>,
    name: &'static str,
) -> std::result::Result<T, ResponseParseCause> {
    res.map_err(ResponseParseCause::field(name))
}

fn deser_type(buf: &mut &[u8]) -> std::result::Result<ColumnType, ResponseParseCause> {
    let id = field(types::read_short(buf), "type id")?;
    let typ = match id {
        0x0000 => ColumnType::Custom(field(types::read_string(buf), "custom class")?.to_owned()),
        0x0020 => ColumnType::List(Box::new(deser_type(buf)?)),
        0x0021 => {
            let key = deser_type(buf)?;
            let value = deser_type(buf)?;
            ColumnType::Map(Box::new(key), Box::new(value))
        }
        0x0022 => ColumnType::Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace = field(types::read_string(buf), "udt keyspace")?.to_owned();
            let name = field(types::read_string(buf), "udt name")?.to_owned();
            let n = field(types::read_short(buf), "udt field count")?;
            let fields = (0..n)
                .map(|_| -> std::result::Result<(String, ColumnType), ResponseParseCause> {
                    let fname = field(types::read_string(buf), "udt field name")?.to_owned();
                    Ok((fname, deser_type(buf)?))
                })
                .collect::<std::result::Result<_, ResponseParseCause>>()?;
            ColumnType::UserDefinedType {
                keyspace,
                name,
                fields,
            }
        }
        0x0031 => {
            let n = field(types::read_short(buf), "tuple size")?;
            ColumnType::Tuple(
                (0..n)
                    .map(|_| deser_type(buf))
                    .collect::<std::result::Result<_, _>>()?,
            )
        }
        native => ColumnType::Native(native),
    };
    Ok(typ)
}

fn deser_rows_metadata(
    buf: &mut &[u8],
) -> std::result::Result<(ResultMetadata, Option<Bytes>), ResponseParseCause> {
    let flags = field(types::read_int(buf), "metadata flags")?;
    let col_count = field(types::read_int(buf), "column count")?;
    let col_count = usize::try_from(col_count).map_err(|err| ResponseParseCause::Field {
        field: "column count",
        err: err.into(),
    })?;

    let paging_state = if flags & FLAG_HAS_MORE_PAGES != 0 {
        Some(Bytes::copy_from_slice(field(
            types::read_bytes(buf),
            "paging state",
        )?))
    } else {
        None
    };

    if flags & FLAG_NO_METADATA != 0 {
        return Ok((
            ResultMetadata {
                col_count,
                col_specs: Vec::new(),
            },
            paging_state,
        ));
    }

    let global_spec = if flags & FLAG_GLOBAL_TABLES_SPEC != 0 {
        let keyspace = field(types::read_string(buf), "keyspace")?.to_owned();
        let table = field(types::read_string(buf), "table")?.to_owned();
        Some((keyspace, table))
    } else {
        None
    };

    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let (keyspace, table) = match &global_spec {
            Some(spec) => spec.clone(),
            None => (
                field(types::read_string(buf), "keyspace")?.to_owned(),
                field(types::read_string(buf), "table")?.to_owned(),
            ),
        };
        let name = field(types::read_string(buf), "column name")?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            keyspace,
            table,
            name,
            typ,
        });
    }

    Ok((
        ResultMetadata {
            col_count,
            col_specs,
        },
        paging_state,
    ))
}

fn deser_rows(buf: &mut &[u8]) -> std::result::Result<RawRows, ResponseParseCause> {
    let (metadata, paging_state) = deser_rows_metadata(buf)?;
    let rows_count = field(types::read_int(buf), "rows count")?;
    let rows_count = usize::try_from(rows_count).map_err(|err| ResponseParseCause::Field {
        field: "rows count",
        err: err.into(),
    })?;
    let raw_rows = Bytes::copy_from_slice(*buf);
    *buf = &[];

    Ok(RawRows {
        metadata,
        paging_state,
        rows_count,
        raw_rows,
    })
}

fn deser_prepared(buf: &mut &[u8]) -> std::result::Result<Prepared, ResponseParseCause> {
    let id = Bytes::copy_from_slice(field(types::read_short_bytes(buf), "prepared id")?);
    let raw_metadata = Bytes::copy_from_slice(*buf);
    *buf = &[];
    Ok(Prepared { id, raw_metadata })
}

pub fn deserialize(buf: &mut &[u8]) -> std::result::Result<Result, ResponseParseCause> {
    let kind = field(types::read_int(buf), "result kind")?;
    Ok(match kind {
        0x0001 => Result::Void,
        0x0002 => Result::Rows(deser_rows(buf)?),
        0x0003 => Result::SetKeyspace(SetKeyspace {
            keyspace_name: field(types::read_string(buf), "keyspace")?.to_owned(),
        }),
        0x0004 => Result::Prepared(deser_prepared(buf)?),
        0x0005 => Result::SchemaChange(SchemaChange {
            event: SchemaChangeEvent::deserialize(buf)?,
        }),
        other => return Err(ResponseParseCause::UnknownResultKind(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn rows_body(paging_state: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(0x0002, &mut buf);
        let mut flags = FLAG_GLOBAL_TABLES_SPEC;
        if paging_state.is_some() {
            flags |= FLAG_HAS_MORE_PAGES;
        }
        types::write_int(flags, &mut buf);
        types::write_int(2, &mut buf);
        if let Some(state) = paging_state {
            types::write_bytes(state, &mut buf).unwrap();
        }
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("tab", &mut buf).unwrap();
        types::write_string("pk", &mut buf).unwrap();
        types::write_short(0x0009, &mut buf); // int
        types::write_string("tags", &mut buf).unwrap();
        types::write_short(0x0021, &mut buf); // map<text, list<int>>
        types::write_short(0x000D, &mut buf);
        types::write_short(0x0020, &mut buf);
        types::write_short(0x0009, &mut buf);
        types::write_int(1, &mut buf);
        buf.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 7, 0xFF, 0xFF, 0xFF, 0xFF]);
        buf
    }

    #[test]
    fn rows_with_paging_state() {
        let body = rows_body(Some(&[0xAA, 0xBB]));
        let rows = assert_matches!(deserialize(&mut &body[..]), Ok(Result::Rows(rows)) => rows);
        assert_eq!(rows.paging_state.as_deref(), Some(&[0xAA, 0xBB][..]));
        assert_eq!(rows.rows_count, 1);
        assert_eq!(rows.metadata.col_specs.len(), 2);
        assert_eq!(
            rows.metadata.col_specs[1].typ,
            ColumnType::Map(
                Box::new(ColumnType::Native(0x000D)),
                Box::new(ColumnType::List(Box::new(ColumnType::Native(0x0009))))
            )
        );
        assert_eq!(rows.raw_rows.len(), 12);
    }

    #[test]
    fn last_page_has_no_paging_state() {
        let body = rows_body(None);
        let rows = assert_matches!(deserialize(&mut &body[..]), Ok(Result::Rows(rows)) => rows);
        assert_eq!(rows.paging_state, None);
    }

    #[test]
    fn prepared_and_unknown_kind() {
        let mut body = Vec::new();
        types::write_int(0x0004, &mut body);
        types::write_short_bytes(&[0xDE, 0xAD], &mut body).unwrap();
        body.extend_from_slice(&[0, 0, 0, 0]);
        assert_matches!(
            deserialize(&mut &body[..]),
            Ok(Result::Prepared(p)) if &p.id[..] == [0xDE, 0xAD] && p.raw_metadata.len() == 4
        );

        let mut body = Vec::new();
        types::write_int(0x0042, &mut body);
        assert_matches!(
            deserialize(&mut &body[..]),
            Err(ResponseParseCause::UnknownResultKind(0x42))
        );
    }
}
