//! Execution of one logical request.
//!
//! [`RequestExecution`] walks the host plan of a request through an explicit
//! state machine:
//!
//! ```text
//! AwaitingHost -> [AwaitingPrepare] -> AwaitingSend -> AwaitingResponse -> Complete
//!      ^                                                     |
//!      +------------------- retry / failover ----------------+
//! ```
//!
//! Every failed attempt is classified and either retried (on the same host or
//! the next one in the plan), answered by re-preparing the statement on the
//! same connection, or surfaced to the caller.

use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use quorum_cql::frame::request::query::QueryParameters;
use quorum_cql::frame::response::{result, NonErrorResponse};
use quorum_cql::values::SerializedValues;
use tracing::{debug, trace, trace_span, Instrument, Span};

use super::session::SessionInner;
use crate::cluster::Host;
use crate::errors::{
    DbError, ErrorClass, ExecutionError, NoHostAvailable, RequestAttemptError,
};
use crate::network::PooledConnection;
use crate::policies::load_balancing::{Plan, RoutingInfo};
use crate::policies::retry::{ClientTimeoutRetry, RetryContext, RetryDecision, RetryPolicy};
use crate::response::{NonErrorQueryResponse, PagingState, QueryResponse};
use crate::statement::{Batch, PreparedStatement, Statement, StatementConfig};
use crate::{Consistency, SerialConsistency};

/// Resolves to the response together with the connection it came on.
type ResponseFuture<'a> = Pin<
    Box<
        dyn Future<Output = (PooledConnection, Result<QueryResponse, RequestAttemptError>)>
            + Send
            + 'a,
    >,
>;

/// Which page of a paged request to fetch.
#[derive(Debug, Clone)]
pub(crate) struct PageRequest {
    pub(crate) page_size: i32,
    pub(crate) paging_state: PagingState,
}

/// What is being executed. Values are bound already.
pub(crate) enum ExecutionRequest<'a> {
    Query {
        statement: &'a Statement,
        values: &'a SerializedValues,
        page: Option<PageRequest>,
    },
    Execute {
        prepared: &'a PreparedStatement,
        values: &'a SerializedValues,
        page: Option<PageRequest>,
    },
    Batch {
        batch: &'a Batch,
        values: &'a [SerializedValues],
    },
    Prepare {
        statement: &'a Statement,
    },
}

impl<'a> ExecutionRequest<'a> {
    fn config(&self) -> &'a StatementConfig {
        match *self {
            ExecutionRequest::Query { statement, .. } => &statement.config,
            ExecutionRequest::Execute { prepared, .. } => &prepared.config,
            ExecutionRequest::Batch { batch, .. } => &batch.config,
            ExecutionRequest::Prepare { statement } => &statement.config,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ExecutionRequest::Query { .. } => "query",
            ExecutionRequest::Execute { .. } => "execute",
            ExecutionRequest::Batch { .. } => "batch",
            ExecutionRequest::Prepare { .. } => "prepare",
        }
    }

    fn is_paged(&self) -> bool {
        matches!(
            self,
            ExecutionRequest::Query { page: Some(_), .. }
                | ExecutionRequest::Execute { page: Some(_), .. }
        )
    }

    /// Text of the statement the node reported as unprepared, if it belongs to this request.
    fn statement_to_reprepare(&self, id: &Bytes) -> Option<&'a str> {
        match *self {
            ExecutionRequest::Execute { prepared, .. } if prepared.get_id() == id => {
                Some(prepared.get_statement())
            }
            ExecutionRequest::Batch { batch, .. } => batch
                .prepared_with_id(id)
                .map(PreparedStatement::get_statement),
            _ => None,
        }
    }

    fn send(
        &self,
        mut connection: PooledConnection,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        request_timeout: Option<Duration>,
    ) -> ResponseFuture<'a> {
        match self {
            ExecutionRequest::Query {
                statement,
                values,
                page,
            } => {
                let (statement, values): (&'a Statement, &'a SerializedValues) =
                    (*statement, *values);
                let parameters = query_parameters(
                    &statement.config,
                    consistency,
                    serial_consistency,
                    values,
                    page.as_ref(),
                );
                Box::pin(async move {
                    connection.dispatched();
                    let result = connection
                        .query_raw(statement, parameters, request_timeout)
                        .await;
                    (connection, result)
                })
            }
            ExecutionRequest::Execute {
                prepared,
                values,
                page,
            } => {
                let (prepared, values): (&'a PreparedStatement, &'a SerializedValues) =
                    (*prepared, *values);
                let parameters = query_parameters(
                    &prepared.config,
                    consistency,
                    serial_consistency,
                    values,
                    page.as_ref(),
                );
                Box::pin(async move {
                    connection.dispatched();
                    let result = connection
                        .execute_raw(prepared, parameters, request_timeout)
                        .await;
                    (connection, result)
                })
            }
            ExecutionRequest::Batch { batch, values } => {
                let (batch, values): (&'a Batch, &'a [SerializedValues]) = (*batch, *values);
                Box::pin(async move {
                    connection.dispatched();
                    let result = connection
                        .batch_raw(
                            batch,
                            values,
                            consistency,
                            serial_consistency,
                            request_timeout,
                        )
                        .await;
                    (connection, result)
                })
            }
            ExecutionRequest::Prepare { statement } => {
                let statement: &'a Statement = *statement;
                Box::pin(async move {
                    connection.dispatched();
                    let result = connection.prepare_raw(statement, request_timeout).await;
                    (connection, result)
                })
            }
        }
    }

    /// Rejects successful responses of the wrong kind.
    fn check_response(
        &self,
        response: NonErrorQueryResponse,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        let unexpected = match (self, &response.response) {
            (
                ExecutionRequest::Prepare { .. },
                NonErrorResponse::Result(result::Result::Prepared(_)),
            ) => None,
            (ExecutionRequest::Prepare { .. }, other) => Some(other.kind()),
            (_, NonErrorResponse::Result(_)) => None,
            (_, other) => Some(other.kind()),
        };
        match unexpected {
            Some(kind) => Err(RequestAttemptError::UnexpectedResponse(kind)),
            None => Ok(response),
        }
    }
}

fn query_parameters<'v>(
    config: &StatementConfig,
    consistency: Consistency,
    serial_consistency: Option<SerialConsistency>,
    values: &'v SerializedValues,
    page: Option<&PageRequest>,
) -> QueryParameters<'v> {
    QueryParameters {
        consistency,
        serial_consistency,
        timestamp: config.timestamp,
        page_size: page.map(|page| page.page_size),
        paging_state: page.and_then(|page| page.paging_state.as_bytes_slice().cloned()),
        skip_metadata: false,
        values: Cow::Borrowed(values),
    }
}

/// How a request ended when it did not fail.
#[derive(Debug)]
pub(crate) enum RunRequestResult {
    Completed(NonErrorQueryResponse),
    /// The retry policy chose to ignore a write error.
    IgnoredWriteError,
}

#[derive(Debug)]
pub(crate) struct Executed {
    pub(crate) result: RunRequestResult,
    pub(crate) coordinator: SocketAddr,
}

/// A host and the connection borrowed from its pool.
struct Target<'a> {
    host: &'a Arc<Host>,
    connection: PooledConnection,
}

enum ExecutionState<'a> {
    /// Picking the next host, or going back to `retry_on`.
    AwaitingHost { retry_on: Option<&'a Arc<Host>> },
    /// The node forgot the statement; prepare it again on the same connection.
    AwaitingPrepare {
        target: Target<'a>,
        statement: &'a str,
        id: Bytes,
    },
    AwaitingSend { target: Target<'a> },
    /// The connection travels inside `response` and comes back with it.
    AwaitingResponse {
        host: &'a Arc<Host>,
        started: Instant,
        response: ResponseFuture<'a>,
    },
    Complete(Result<Executed, ExecutionError>),
}

/// One logical request, from the first host of its plan to the final outcome.
pub(crate) struct RequestExecution<'a> {
    session: &'a SessionInner,
    request: ExecutionRequest<'a>,
    plan: Plan<'a>,
    consistency: Consistency,
    serial_consistency: Option<SerialConsistency>,
    is_idempotent: bool,
    request_timeout: Option<Duration>,
    retry_policy: &'a dyn RetryPolicy,
    client_timeout_retry: ClientTimeoutRetry,
    // Every retry and failover of this request.
    retry_count: u32,
    // Only the retries the retry policy asked for.
    policy_retry_count: u32,
    reprepared: bool,
    // Hosts already retried once after a client timeout.
    timed_out_on: Vec<SocketAddr>,
    errors: Vec<(SocketAddr, RequestAttemptError)>,
    span: Span,
}

impl<'a> RequestExecution<'a> {
    pub(crate) fn new(session: &'a SessionInner, request: ExecutionRequest<'a>) -> Self {
        let config = request.config();
        let consistency = config.determine_consistency(session.consistency);
        let serial_consistency =
            config.determine_serial_consistency(session.serial_consistency);

        let keyspace = session.keyspace.load_full();
        let routing_info = RoutingInfo {
            keyspace: keyspace.as_deref().map(|keyspace| keyspace.as_str()),
            consistency,
            serial_consistency,
            is_idempotent: config.is_idempotent,
        };
        let plan = session
            .load_balancing
            .plan(&routing_info, session.hosts.as_slice());

        let span = trace_span!("request", kind = request.kind());

        RequestExecution {
            session,
            consistency,
            serial_consistency,
            is_idempotent: config.is_idempotent,
            request_timeout: config.request_timeout.or(session.request_timeout),
            retry_policy: config
                .retry_policy
                .as_deref()
                .unwrap_or(session.retry_policy.as_ref()),
            client_timeout_retry: config
                .client_timeout_retry
                .unwrap_or(session.client_timeout_retry),
            request,
            plan,
            retry_count: 0,
            policy_retry_count: 0,
            reprepared: false,
            timed_out_on: Vec::new(),
            errors: Vec::new(),
            span,
        }
    }

    pub(crate) async fn run(mut self) -> Result<Executed, ExecutionError> {
        let mut state = ExecutionState::AwaitingHost { retry_on: None };
        loop {
            state = match state {
                ExecutionState::AwaitingHost { retry_on } => self.acquire(retry_on).await,
                ExecutionState::AwaitingPrepare {
                    target,
                    statement,
                    id,
                } => match target.connection.reprepare(statement, &id).await {
                    Ok(()) => {
                        self.reprepared = true;
                        ExecutionState::AwaitingSend { target }
                    }
                    Err(error) => self.on_failure(target, error),
                },
                ExecutionState::AwaitingSend { target } => self.send(target),
                ExecutionState::AwaitingResponse {
                    host,
                    started,
                    response,
                } => {
                    let (connection, result) = response.await;
                    self.on_response(Target { host, connection }, started, result)
                }
                ExecutionState::Complete(result) => return result,
            };
        }
    }

    async fn acquire(&mut self, retry_on: Option<&'a Arc<Host>>) -> ExecutionState<'a> {
        let host = match retry_on.or_else(|| self.plan.next()) {
            Some(host) => host,
            None => return ExecutionState::Complete(Err(self.exhausted_error())),
        };
        let node_addr = host.address();

        let Some(pool) = self.session.pools.get(&node_addr) else {
            trace!(parent: &self.span, %node_addr, "Host has no pool");
            return ExecutionState::AwaitingHost { retry_on: None };
        };

        match pool.borrow().await {
            Ok(connection) => ExecutionState::AwaitingSend {
                target: Target { host, connection },
            },
            Err(error) => {
                trace!(
                    parent: &self.span,
                    %node_addr,
                    error = %error,
                    "Choosing connection failed"
                );
                self.errors.push((node_addr, error.into()));
                ExecutionState::AwaitingHost { retry_on: None }
            }
        }
    }

    fn send(&mut self, target: Target<'a>) -> ExecutionState<'a> {
        if self.request.is_paged() {
            self.session.metrics.inc_total_paged_queries();
        } else {
            self.session.metrics.inc_total_nonpaged_queries();
        }

        let node_addr = target.host.address();
        let attempt_span = trace_span!(parent: &self.span, "Executing request", node = %node_addr);
        trace!(
            parent: &attempt_span,
            connection = %target.connection.get_connect_address(),
            consistency = %self.consistency,
            retry_count = self.retry_count,
            "Sending"
        );
        let response = self
            .request
            .send(
                target.connection,
                self.consistency,
                self.serial_consistency,
                self.request_timeout,
            )
            .instrument(attempt_span);

        ExecutionState::AwaitingResponse {
            host: target.host,
            started: Instant::now(),
            response: Box::pin(response),
        }
    }

    fn on_response(
        &mut self,
        target: Target<'a>,
        started: Instant,
        result: Result<QueryResponse, RequestAttemptError>,
    ) -> ExecutionState<'a> {
        let result = result
            .and_then(QueryResponse::into_non_error_query_response)
            .and_then(|response| self.request.check_response(response));

        match result {
            Ok(response) => {
                trace!(parent: &self.span, node = %target.host.address(), "Request succeeded");
                if let Err(err) = self
                    .session
                    .metrics
                    .log_query_latency(started.elapsed().as_millis() as u64)
                {
                    trace!(parent: &self.span, error = %err, "Latency not recorded");
                }
                ExecutionState::Complete(Ok(Executed {
                    result: RunRequestResult::Completed(response),
                    coordinator: target.host.address(),
                }))
            }
            Err(error) => {
                if self.request.is_paged() {
                    self.session.metrics.inc_failed_paged_queries();
                } else {
                    self.session.metrics.inc_failed_nonpaged_queries();
                }
                self.on_failure(target, error)
            }
        }
    }

    fn on_failure(&mut self, target: Target<'a>, error: RequestAttemptError) -> ExecutionState<'a> {
        let class = error.classify();
        let node_addr = target.host.address();
        trace!(
            parent: &self.span,
            node = %node_addr,
            error = %error,
            %class,
            "Request failed"
        );

        match class {
            ErrorClass::Unprepared => {
                let statement = match &error {
                    RequestAttemptError::DbError(DbError::Unprepared { statement_id }, _) => self
                        .request
                        .statement_to_reprepare(statement_id)
                        .map(|statement| (statement, statement_id.clone())),
                    _ => None,
                };
                match statement {
                    Some((statement, id)) if !self.reprepared => {
                        self.session.metrics.inc_reprepares_num();
                        debug!(
                            parent: &self.span,
                            node = %node_addr,
                            statement,
                            "Node does not know the statement, preparing it again"
                        );
                        ExecutionState::AwaitingPrepare {
                            target,
                            statement,
                            id,
                        }
                    }
                    _ => self.rethrow(error),
                }
            }
            ErrorClass::Validation => self.rethrow(error),
            ErrorClass::Connectivity => {
                self.session.host_status.mark_down(target.host);
                self.retry_next(node_addr, error)
            }
            ErrorClass::Transient => self.retry_next(node_addr, error),
            ErrorClass::ClientTimeout => {
                if !self.is_idempotent {
                    return self.rethrow(error);
                }
                match self.client_timeout_retry {
                    ClientTimeoutRetry::Rethrow => self.rethrow(error),
                    ClientTimeoutRetry::SameHost if !self.timed_out_on.contains(&node_addr) => {
                        self.timed_out_on.push(node_addr);
                        self.retry_same(target.host, error)
                    }
                    ClientTimeoutRetry::SameHost | ClientTimeoutRetry::NextHost => {
                        self.retry_next(node_addr, error)
                    }
                }
            }
            ErrorClass::Consistency => self.consult_retry_policy(target, error),
        }
    }

    fn consult_retry_policy(
        &mut self,
        target: Target<'a>,
        error: RequestAttemptError,
    ) -> ExecutionState<'a> {
        let context = RetryContext {
            consistency: self.consistency,
            is_idempotent: self.is_idempotent,
            retry_count: self.policy_retry_count,
        };
        let (decision, next_host) = match &error {
            RequestAttemptError::DbError(
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                },
                _,
            ) => (
                self.retry_policy
                    .on_read_timeout(&context, *received, *required, *data_present),
                false,
            ),
            RequestAttemptError::DbError(
                DbError::WriteTimeout {
                    write_type,
                    received,
                    required,
                    ..
                },
                _,
            ) => (
                self.retry_policy
                    .on_write_timeout(&context, write_type, *received, *required),
                false,
            ),
            RequestAttemptError::DbError(DbError::Unavailable { required, alive, .. }, _) => (
                self.retry_policy.on_unavailable(&context, *required, *alive),
                true,
            ),
            _ => (RetryDecision::Rethrow, false),
        };
        trace!(parent: &self.span, retry_decision = ?decision);

        match decision {
            RetryDecision::Rethrow => self.rethrow(error),
            RetryDecision::Ignore => ExecutionState::Complete(Ok(Executed {
                result: RunRequestResult::IgnoredWriteError,
                coordinator: target.host.address(),
            })),
            RetryDecision::Retry(consistency) => {
                self.policy_retry_count += 1;
                self.consistency = consistency.unwrap_or(self.consistency);
                if next_host {
                    self.retry_next(target.host.address(), error)
                } else {
                    self.retry_same(target.host, error)
                }
            }
        }
    }

    fn retry_same(&mut self, host: &'a Arc<Host>, error: RequestAttemptError) -> ExecutionState<'a> {
        self.record_retry(host.address(), error);
        ExecutionState::AwaitingHost {
            retry_on: Some(host),
        }
    }

    fn retry_next(&mut self, node_addr: SocketAddr, error: RequestAttemptError) -> ExecutionState<'a> {
        self.record_retry(node_addr, error);
        ExecutionState::AwaitingHost { retry_on: None }
    }

    fn record_retry(&mut self, node_addr: SocketAddr, error: RequestAttemptError) {
        self.session.metrics.inc_retries_num();
        self.retry_count += 1;
        self.errors.push((node_addr, error));
    }

    fn rethrow(&mut self, error: RequestAttemptError) -> ExecutionState<'a> {
        ExecutionState::Complete(Err(ExecutionError::LastAttemptError(error)))
    }

    fn exhausted_error(&mut self) -> ExecutionError {
        if self.errors.is_empty() {
            ExecutionError::EmptyPlan
        } else {
            ExecutionError::NoHostAvailable(NoHostAvailable {
                errors: std::mem::take(&mut self.errors),
            })
        }
    }
}
