use crate::errors::{DbError, WriteType};
use crate::frame::frame_errors::{LowLevelDeserializationError, ResponseParseCause};
use crate::frame::types::{self, Consistency};
use bytes::Bytes;

/// An ERROR response: the server-side error and its human readable reason.
#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

/// Reads the code-specific trailer of an ERROR body.
struct ErrorBodyReader<'a, 'b> {
    buf: &'a mut &'b [u8],
}

impl ErrorBodyReader<'_, '_> {
    fn wrap<T>(
        res: Result<T, LowLevelDeserializationError>,
        field: &'static str,
    ) -> Result<T, ResponseParseCause> {
        res.map_err(ResponseParseCause::field(field))
    }

    fn consistency(&mut self) -> Result<Consistency, ResponseParseCause> {
        Self::wrap(types::read_consistency(self.buf), "consistency")
    }

    fn int(&mut self, field: &'static str) -> Result<i32, ResponseParseCause> {
        Self::wrap(types::read_int(self.buf), field)
    }

    fn flag(&mut self, field: &'static str) -> Result<bool, ResponseParseCause> {
        Self::wrap(types::read_raw_bytes(1, self.buf), field).map(|b| b[0] != 0)
    }

    fn string(&mut self, field: &'static str) -> Result<String, ResponseParseCause> {
        Self::wrap(types::read_string(self.buf), field).map(str::to_owned)
    }
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseCause> {
        let code = types::read_int(buf).map_err(ResponseParseCause::field("code"))?;
        let reason = types::read_string(buf)
            .map_err(ResponseParseCause::field("reason"))?
            .to_owned();

        let mut rd = ErrorBodyReader { buf };
        let error = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: rd.consistency()?,
                required: rd.int("required")?,
                alive: rd.int("alive")?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: rd.consistency()?,
                received: rd.int("received")?,
                required: rd.int("required")?,
                write_type: WriteType::from(rd.string("write_type")?.as_str()),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: rd.consistency()?,
                received: rd.int("received")?,
                required: rd.int("required")?,
                data_present: rd.flag("data_present")?,
            },
            0x1300 => DbError::ReadFailure {
                consistency: rd.consistency()?,
                received: rd.int("received")?,
                required: rd.int("required")?,
                numfailures: rd.int("numfailures")?,
                data_present: rd.flag("data_present")?,
            },
            0x1400 => DbError::FunctionFailure {
                keyspace: rd.string("keyspace")?,
                function: rd.string("function")?,
                arg_types: ErrorBodyReader::wrap(types::read_string_list(rd.buf), "arg_types")?,
            },
            0x1500 => DbError::WriteFailure {
                consistency: rd.consistency()?,
                received: rd.int("received")?,
                required: rd.int("required")?,
                numfailures: rd.int("numfailures")?,
                write_type: WriteType::from(rd.string("write_type")?.as_str()),
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: rd.string("keyspace")?,
                table: rd.string("table")?,
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::copy_from_slice(ErrorBodyReader::wrap(
                    types::read_short_bytes(rd.buf),
                    "statement_id",
                )?),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn body(code: i32, reason: &str, trailer: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(code, &mut buf);
        types::write_string(reason, &mut buf).unwrap();
        trailer(&mut buf);
        buf
    }

    #[test]
    fn simple_codes() {
        let cases = [
            (0x0000, DbError::ServerError),
            (0x1001, DbError::Overloaded),
            (0x1002, DbError::IsBootstrapping),
            (0x2000, DbError::SyntaxError),
            (0x2200, DbError::Invalid),
            (0x7777, DbError::Other(0x7777)),
        ];
        for (code, expected) in cases {
            let buf = body(code, "reason", |_| {});
            let err = Error::deserialize(&mut &buf[..]).unwrap();
            assert_eq!(err.error, expected);
            assert_eq!(err.reason, "reason");
        }
    }

    #[test]
    fn consistency_errors_carry_ack_counts() {
        let buf = body(0x1200, "read timed out", |b| {
            types::write_consistency(Consistency::Quorum, b);
            types::write_int(1, b);
            types::write_int(2, b);
            b.push(0);
        });
        assert_eq!(
            Error::deserialize(&mut &buf[..]).unwrap().error,
            DbError::ReadTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                required: 2,
                data_present: false,
            }
        );

        let buf = body(0x1100, "write timed out", |b| {
            types::write_consistency(Consistency::One, b);
            types::write_int(0, b);
            types::write_int(1, b);
            types::write_string("BATCH_LOG", b).unwrap();
        });
        assert_matches!(
            Error::deserialize(&mut &buf[..]).unwrap().error,
            DbError::WriteTimeout {
                write_type: WriteType::BatchLog,
                ..
            }
        );
    }

    #[test]
    fn unprepared_carries_statement_id() {
        let buf = body(0x2500, "unknown id", |b| {
            types::write_short_bytes(&[1, 2, 3], b).unwrap();
        });
        assert_matches!(
            Error::deserialize(&mut &buf[..]).unwrap().error,
            DbError::Unprepared { statement_id } if &statement_id[..] == [1, 2, 3]
        );
    }

    #[test]
    fn truncated_trailer_names_the_field() {
        let buf = body(0x1000, "unavailable", |b| {
            types::write_consistency(Consistency::All, b);
        });
        assert_matches!(
            Error::deserialize(&mut &buf[..]),
            Err(ResponseParseCause::Field {
                field: "required",
                ..
            })
        );
    }
}
