//! Transparent paging of a statement's results.
//!
//! A [`QueryPager`] yields one [`QueryResult`] per page. The first page is
//! fetched when the pager is created; the following ones are fetched by a
//! worker task, one page ahead of the consumer.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use quorum_cql::values::SerializedValues;
use tokio::sync::mpsc;
use tracing::{trace, Instrument};

use super::execution::{ExecutionRequest, PageRequest};
use super::session::SessionInner;
use crate::errors::ExecutionError;
use crate::response::{PagingState, PagingStateResponse, QueryResult};
use crate::statement::{PreparedStatement, Statement};

/// An owned statement with its values, re-sent for every page.
pub(crate) enum PagerRequest {
    Query {
        statement: Statement,
        values: SerializedValues,
    },
    Execute {
        prepared: PreparedStatement,
        values: SerializedValues,
    },
}

impl PagerRequest {
    fn as_execution_request(&self, page: PageRequest) -> ExecutionRequest<'_> {
        match self {
            PagerRequest::Query { statement, values } => ExecutionRequest::Query {
                statement,
                values,
                page: Some(page),
            },
            PagerRequest::Execute { prepared, values } => ExecutionRequest::Execute {
                prepared,
                values,
                page: Some(page),
            },
        }
    }
}

async fn fetch_page(
    session: &Arc<SessionInner>,
    request: &PagerRequest,
    page_size: i32,
    paging_state: PagingState,
) -> Result<(QueryResult, PagingStateResponse), ExecutionError> {
    let executed = session
        .run(request.as_execution_request(PageRequest {
            page_size,
            paging_state,
        }))
        .await?;
    session.finish(executed).await
}

// Fetches the pages after the first one, until the last page, an error, or
// the pager being dropped.
struct PagerWorker {
    session: Arc<SessionInner>,
    request: PagerRequest,
    page_size: i32,
    paging_state: PagingState,
    sender: mpsc::Sender<Result<QueryResult, ExecutionError>>,
}

impl PagerWorker {
    async fn work(mut self) {
        loop {
            let (page, next) = match fetch_page(
                &self.session,
                &self.request,
                self.page_size,
                self.paging_state.clone(),
            )
            .await
            {
                Ok((page, paging_state_response)) => (
                    Ok(page),
                    paging_state_response.into_paging_control_flow(),
                ),
                Err(err) => (Err(err), ControlFlow::Break(())),
            };

            if self.sender.send(page).await.is_err() {
                trace!("Pager dropped, stopping");
                return;
            }
            match next {
                ControlFlow::Continue(paging_state) => self.paging_state = paging_state,
                ControlFlow::Break(()) => return,
            }
        }
    }
}

/// An async stream of the pages of a statement's result.
///
/// Every page is an independent request, with its own host plan, retries
/// and failover. The stream ends after the last page or the first error.
///
/// Dropping the pager stops fetching.
pub struct QueryPager {
    first_page: Option<QueryResult>,
    page_receiver: Option<mpsc::Receiver<Result<QueryResult, ExecutionError>>>,
}

impl QueryPager {
    pub(crate) async fn new(
        session: Arc<SessionInner>,
        request: PagerRequest,
        page_size: i32,
    ) -> Result<Self, ExecutionError> {
        let (first_page, paging_state_response) =
            fetch_page(&session, &request, page_size, PagingState::start()).await?;

        let page_receiver = match paging_state_response.into_paging_control_flow() {
            ControlFlow::Break(()) => None,
            ControlFlow::Continue(paging_state) => {
                let (sender, receiver) = mpsc::channel(1);
                let worker = PagerWorker {
                    session,
                    request,
                    page_size,
                    paging_state,
                    sender,
                };
                tokio::task::spawn(worker.work().instrument(tracing::trace_span!("pager")));
                Some(receiver)
            }
        };

        Ok(QueryPager {
            first_page: Some(first_page),
            page_receiver,
        })
    }
}

impl Stream for QueryPager {
    type Item = Result<QueryResult, ExecutionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(page) = this.first_page.take() {
            return Poll::Ready(Some(Ok(page)));
        }
        match this.page_receiver.as_mut() {
            Some(receiver) => receiver.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl std::fmt::Debug for QueryPager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPager")
            .field("first_page_pending", &self.first_page.is_some())
            .field("has_more_pages", &self.page_receiver.is_some())
            .finish()
    }
}
