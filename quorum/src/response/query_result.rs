//! Results of requests and the paging cursor that links consecutive pages.

use std::net::SocketAddr;
use std::ops::ControlFlow;

use bytes::Bytes;
use quorum_cql::frame::frame_errors::LowLevelDeserializationError;
use quorum_cql::frame::response::result::{ColumnSpec, RawRows};
use quorum_cql::frame::types;
use uuid::Uuid;

/// Result of a single request to the database. It represents any kind of RESULT frame.
///
/// Rows are kept in their raw binary form; decoding cell values is up to the
/// caller's type codec. With paging, this holds exactly one page.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    raw_rows: Option<RawRows>,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
    coordinator: Option<SocketAddr>,
}

impl QueryResult {
    pub(crate) fn new(
        raw_rows: Option<RawRows>,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            raw_rows,
            tracing_id,
            warnings,
            coordinator: None,
        }
    }

    /// An empty, successful result. Returned when a retry policy decides to
    /// ignore an error.
    pub(crate) fn void() -> Self {
        Self::default()
    }

    pub(crate) fn with_coordinator(mut self, coordinator: SocketAddr) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Whether the response was of the Rows kind.
    pub fn is_rows(&self) -> bool {
        self.raw_rows.is_some()
    }

    /// Number of rows in this page, if the response was of the Rows kind.
    pub fn rows_num(&self) -> Option<usize> {
        self.raw_rows.as_ref().map(|rows| rows.rows_count)
    }

    /// Column specifications, empty when the node skipped metadata.
    pub fn col_specs(&self) -> &[ColumnSpec] {
        self.raw_rows
            .as_ref()
            .map(|rows| rows.metadata.col_specs.as_slice())
            .unwrap_or_default()
    }

    pub fn raw_rows(&self) -> Option<&RawRows> {
        self.raw_rows.as_ref()
    }

    /// Iterates over rows, each given as its column cells. `None` is a null cell.
    pub fn rows(&self) -> RawRowIterator<'_> {
        match &self.raw_rows {
            Some(rows) => RawRowIterator {
                remaining_rows: rows.rows_count,
                col_count: rows.metadata.col_count,
                buf: &rows.raw_rows,
            },
            None => RawRowIterator {
                remaining_rows: 0,
                col_count: 0,
                buf: &[],
            },
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }

    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// Address of the node that served the request.
    pub fn coordinator(&self) -> Option<SocketAddr> {
        self.coordinator
    }
}

/// Iterator over the rows of a [`QueryResult`].
#[derive(Debug, Clone)]
pub struct RawRowIterator<'a> {
    remaining_rows: usize,
    col_count: usize,
    buf: &'a [u8],
}

impl<'a> Iterator for RawRowIterator<'a> {
    type Item = Result<Vec<Option<&'a [u8]>>, LowLevelDeserializationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_rows == 0 {
            return None;
        }
        self.remaining_rows -= 1;

        let mut row = Vec::with_capacity(self.col_count);
        for _ in 0..self.col_count {
            match types::read_bytes_opt(&mut self.buf) {
                Ok(cell) => row.push(cell),
                Err(err) => {
                    self.remaining_rows = 0;
                    return Some(Err(err));
                }
            }
        }
        Some(Ok(row))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining_rows))
    }
}

/// A cursor to the page that should be fetched next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagingState(Option<Bytes>);

impl PagingState {
    /// A cursor pointing at the first page.
    pub fn start() -> Self {
        Self(None)
    }

    pub fn new_from_raw_bytes(raw_paging_state: impl Into<Bytes>) -> Self {
        Self(Some(raw_paging_state.into()))
    }

    /// The raw cursor, `None` for the first page.
    pub fn as_bytes_slice(&self) -> Option<&Bytes> {
        self.0.as_ref()
    }
}

/// Whether a page was the last one, and if not, how to fetch the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagingStateResponse {
    HasMorePages { state: PagingState },
    NoMorePages,
}

impl PagingStateResponse {
    pub(crate) fn new_from_raw_bytes(raw_paging_state: Option<Bytes>) -> Self {
        match raw_paging_state {
            Some(raw) => Self::HasMorePages {
                state: PagingState::new_from_raw_bytes(raw),
            },
            None => Self::NoMorePages,
        }
    }

    pub fn finished(&self) -> bool {
        matches!(self, Self::NoMorePages)
    }

    /// `Continue` with the next cursor, or `Break` after the last page.
    pub fn into_paging_control_flow(self) -> ControlFlow<(), PagingState> {
        match self {
            Self::HasMorePages { state } => ControlFlow::Continue(state),
            Self::NoMorePages => ControlFlow::Break(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use bytes::{BufMut, Bytes, BytesMut};
    use quorum_cql::frame::response::result::{RawRows, ResultMetadata};

    use super::{PagingState, PagingStateResponse, QueryResult};

    fn two_rows_two_columns() -> RawRows {
        let mut buf = BytesMut::new();
        // row 1: "a", null
        buf.put_i32(1);
        buf.put_u8(b'a');
        buf.put_i32(-1);
        // row 2: "bc", ""
        buf.put_i32(2);
        buf.put_slice(b"bc");
        buf.put_i32(0);

        RawRows {
            metadata: ResultMetadata {
                col_count: 2,
                col_specs: Vec::new(),
            },
            paging_state: None,
            rows_count: 2,
            raw_rows: buf.freeze(),
        }
    }

    #[test]
    fn iterates_raw_cells() {
        let result = QueryResult::new(Some(two_rows_two_columns()), None, Vec::new());
        assert!(result.is_rows());
        assert_eq!(result.rows_num(), Some(2));

        let rows: Vec<_> = result.rows().collect::<Result<_, _>>().unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some(&b"a"[..]), None],
                vec![Some(&b"bc"[..]), Some(&b""[..])],
            ]
        );
    }

    #[test]
    fn truncated_rows_report_an_error_once() {
        let mut raw = two_rows_two_columns();
        raw.raw_rows = raw.raw_rows.slice(..7);
        let result = QueryResult::new(Some(raw), None, Vec::new());

        let mut rows = result.rows();
        assert!(rows.next().unwrap().is_err());
        assert!(rows.next().is_none());
    }

    #[test]
    fn void_result_has_no_rows() {
        let result = QueryResult::void();
        assert!(!result.is_rows());
        assert_eq!(result.rows_num(), None);
        assert_eq!(result.rows().count(), 0);
        assert!(result.col_specs().is_empty());
    }

    #[test]
    fn paging_state_response_control_flow() {
        let more = PagingStateResponse::new_from_raw_bytes(Some(Bytes::from_static(b"cursor")));
        assert!(!more.finished());
        assert_eq!(
            more.into_paging_control_flow(),
            ControlFlow::Continue(PagingState::new_from_raw_bytes(&b"cursor"[..]))
        );

        let done = PagingStateResponse::new_from_raw_bytes(None);
        assert!(done.finished());
        assert_eq!(done.into_paging_control_flow(), ControlFlow::Break(()));
        assert_eq!(PagingState::start().as_bytes_slice(), None);
    }
}
