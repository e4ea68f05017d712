//! Responses received from the cluster, as seen by the connection and the user.

use quorum_cql::frame::response::authenticate::{AuthChallenge, AuthSuccess, Authenticate};
use quorum_cql::frame::response::{result, NonErrorResponse, Response};
use uuid::Uuid;

use crate::errors::RequestAttemptError;

pub mod query_result;

pub use query_result::{PagingState, PagingStateResponse, QueryResult};

#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

// A QueryResponse in which response can not be Response::Error
#[derive(Debug)]
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        Ok(NonErrorQueryResponse {
            response: self.response.into_non_error_response()?,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn as_set_keyspace(&self) -> Option<&result::SetKeyspace> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SetKeyspace(sk)) => Some(sk),
            _ => None,
        }
    }

    pub(crate) fn as_schema_change(&self) -> Option<&result::SchemaChange> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SchemaChange(sc)) => Some(sc),
            _ => None,
        }
    }

    /// Converts the response into one page of results and the cursor to the next one.
    pub(crate) fn into_query_result_and_paging_state(
        self,
    ) -> Result<(QueryResult, PagingStateResponse), RequestAttemptError> {
        let Self {
            response,
            tracing_id,
            warnings,
        } = self;
        let (raw_rows, paging_state_response) = match response {
            NonErrorResponse::Result(result::Result::Rows(mut rows)) => {
                let paging_state_response = PagingStateResponse::new_from_raw_bytes(
                    rows.paging_state.take(),
                );
                (Some(rows), paging_state_response)
            }
            NonErrorResponse::Result(_) => (None, PagingStateResponse::NoMorePages),
            _ => return Err(RequestAttemptError::UnexpectedResponse(response.kind())),
        };

        Ok((
            QueryResult::new(raw_rows, tracing_id, warnings),
            paging_state_response,
        ))
    }

    pub(crate) fn into_query_result(self) -> Result<QueryResult, RequestAttemptError> {
        self.into_query_result_and_paging_state()
            .map(|(result, _)| result)
    }
}

pub(crate) enum NonErrorStartupResponse {
    Ready,
    Authenticate(Authenticate),
}

pub(crate) enum NonErrorAuthResponse {
    AuthChallenge(AuthChallenge),
    AuthSuccess(AuthSuccess),
}
