//! `Session` is the main object used in the driver.\
//! It manages a connection pool per host and executes statements on them,
//! with failover, retries and paging.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::future::{join_all, RemoteHandle};
use futures::FutureExt;
use quorum_cql::frame::response::event::Event;
use quorum_cql::frame::response::{result, CqlResponseKind, NonErrorResponse};
use quorum_cql::frame::Compression;
use quorum_cql::values::SerializedValues;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::execution::{ExecutionRequest, Executed, PageRequest, RequestExecution, RunRequestResult};
use super::pager::{PagerRequest, QueryPager};
use super::session_builder::SessionBuilder;
use crate::authentication::AuthenticatorProvider;
use crate::cluster::node::resolve_contact_points;
use crate::cluster::{ContactPoint, Host};
use crate::errors::{
    BadQuery, ExecutionError, NewSessionError, RequestAttemptError, SchemaAgreementError,
    UseKeyspaceError,
};
use crate::network::tls::TlsContext;
use crate::network::{
    open_connection, use_keyspace_result, ConnectionConfig, NodeConnectionPool, PoolConfig,
    PoolingOptions, VerifiedKeyspaceName,
};
use crate::observability::metrics::Metrics;
use crate::policies::host_listener::{HostListener, HostStatusNotifier};
use crate::policies::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use crate::policies::retry::{ClientTimeoutRetry, DefaultRetryPolicy, RetryPolicy};
use crate::policies::schema_agreement::{
    agreed_version, PollingSchemaAgreementWaiter, SchemaAgreementWaiter, SchemaVersionSource,
};
use crate::response::{NonErrorQueryResponse, PagingState, PagingStateResponse, QueryResult};
use crate::statement::{validate_page_size, Batch, PreparedStatement, Statement};
use crate::{Consistency, SerialConsistency};

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to use
/// [SessionBuilder](super::session_builder::SessionBuilder)
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Nodes the session connects to. The driver does not discover other
    /// nodes, so these are all the hosts it will ever use.
    pub known_nodes: Vec<ContactPoint>,

    /// Bound on resolving a single hostname. `None` waits as long as the resolver does.
    pub hostname_resolution_timeout: Option<Duration>,

    /// Preferred compression algorithm to use on connections.
    /// If it's not supported by database server Session will fall back to no compression.
    pub compression: Option<Compression>,

    /// Whether to set the nodelay TCP flag.
    pub tcp_nodelay: bool,

    /// TCP keepalive interval, which means how often keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    /// If `None`, no TCP keepalive messages are sent.
    pub tcp_keepalive_interval: Option<Duration>,

    /// Timeout for opening a connection, handshake included.
    pub connect_timeout: Duration,

    /// Client-side timeout of a single request attempt. A request that times
    /// out breaks the connection it was sent on.
    pub request_timeout: Option<Duration>,

    /// How often an OPTIONS request is sent on every connection to check it
    /// is still alive. `None` disables keepalives.
    pub keepalive_interval: Option<Duration>,

    /// How long to wait for the answer to a keepalive before breaking the connection.
    pub keepalive_timeout: Option<Duration>,

    /// Keyspace to be used on all connections.
    /// Each connection will send `"USE <keyspace_name>"` before sending any requests.
    /// This can be later changed with [`Session::use_keyspace`].
    pub used_keyspace: Option<String>,

    /// Whether the keyspace name is case-sensitive.
    pub keyspace_case_sensitive: bool,

    /// Provides authenticator sessions for nodes that require authentication.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// TLS configuration of every connection. `None` connects in plain text.
    pub tls_context: Option<TlsContext>,

    /// Number of stream ids of each connection, which bounds its requests in flight.
    pub max_stream_ids: usize,

    /// Sizes of the per-host connection pools.
    pub pooling: PoolingOptions,

    pub load_balancing: Arc<dyn LoadBalancingPolicy>,

    /// Used for statements that do not set their own retry policy.
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// Where idempotent statements that timed out on the client side go next.
    pub client_timeout_retry: ClientTimeoutRetry,

    /// Consistency of statements that do not set their own.
    pub consistency: Consistency,

    pub serial_consistency: Option<SerialConsistency>,

    pub schema_agreement_waiter: Arc<dyn SchemaAgreementWaiter>,

    /// Bound on waiting for schema agreement.
    pub schema_agreement_timeout: Duration,

    /// Whether statements that changed the schema wait for schema agreement
    /// before returning.
    pub schema_agreement_automatic_waiting: bool,

    /// Notified when hosts go up or down.
    pub host_listeners: Vec<Arc<dyn HostListener>>,

    /// If set, the session keeps one connection registered for server events
    /// and forwards them here.
    pub event_sender: Option<mpsc::Sender<Event>>,
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] with default configuration
    /// # Default configuration
    /// * Compression: None
    /// * Load balancing policy: round robin over every host
    /// * Retry policy: [`DefaultRetryPolicy`]
    /// * Consistency: `LOCAL_QUORUM`
    ///
    /// # Example
    /// ```
    /// # use quorum::client::session::SessionConfig;
    /// let config = SessionConfig::new();
    /// ```
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(30)),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            used_keyspace: None,
            keyspace_case_sensitive: false,
            authenticator: None,
            tls_context: None,
            max_stream_ids: ConnectionConfig::default().max_stream_ids,
            pooling: PoolingOptions::default(),
            load_balancing: Arc::new(RoundRobinPolicy::new()),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            client_timeout_retry: ClientTimeoutRetry::default(),
            consistency: Consistency::default(),
            serial_consistency: Some(SerialConsistency::Serial),
            schema_agreement_waiter: Arc::new(PollingSchemaAgreementWaiter::default()),
            schema_agreement_timeout: Duration::from_secs(60),
            schema_agreement_automatic_waiting: true,
            host_listeners: Vec::new(),
            event_sender: None,
        }
    }

    /// Adds a known database server with a hostname.
    /// If the port is not explicitly specified, 9042 is used as default
    /// # Example
    /// ```
    /// # use quorum::client::session::SessionConfig;
    /// let mut config = SessionConfig::new();
    /// config.add_known_node("127.0.0.1");
    /// config.add_known_node("db1.example.com:9042");
    /// ```
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes
            .push(crate::cluster::KnownNode::Hostname(hostname.as_ref().to_owned()).into());
    }

    /// Adds a known database server with an IP address
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes
            .push(crate::cluster::KnownNode::Address(node_addr).into());
    }

    /// Adds a list of known database server with hostnames.
    pub fn add_known_nodes(&mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) {
        for hostname in hostnames {
            self.add_known_node(hostname);
        }
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            compression: self.compression,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            authenticator: self.authenticator.clone(),
            tls_context: self.tls_context.clone(),
            max_stream_ids: self.max_stream_ids,
            ..Default::default()
        }
    }
}

/// Creates default [`SessionConfig`], same as [`SessionConfig::new`]
impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("known_nodes", &self.known_nodes)
            .field("compression", &self.compression)
            .field("used_keyspace", &self.used_keyspace)
            .field("pooling", &self.pooling)
            .field("load_balancing", &self.load_balancing)
            .field("retry_policy", &self.retry_policy)
            .field("consistency", &self.consistency)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// State shared by a [`Session`], its pagers and its background tasks.
pub(crate) struct SessionInner {
    pub(crate) hosts: Vec<Arc<Host>>,
    pub(crate) pools: HashMap<SocketAddr, NodeConnectionPool>,
    pub(crate) load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) client_timeout_retry: ClientTimeoutRetry,
    pub(crate) consistency: Consistency,
    pub(crate) serial_consistency: Option<SerialConsistency>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) keyspace: ArcSwapOption<VerifiedKeyspaceName>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) host_status: Arc<HostStatusNotifier>,
    schema_agreement_waiter: Arc<dyn SchemaAgreementWaiter>,
    schema_agreement_timeout: Duration,
    schema_agreement_automatic_waiting: bool,
    _event_listener: Option<RemoteHandle<()>>,
}

/// `Session` manages connections to the cluster and allows to execute statements.
///
/// Cloning a session is cheap; clones share pools, policies and metrics.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("hosts", &self.inner.hosts)
            .field("pools", &self.inner.pools)
            .field("load_balancing", &self.inner.load_balancing)
            .field("keyspace", &self.inner.keyspace.load().as_deref().map(|k| k.as_str().to_owned()))
            .field("metrics", &self.inner.metrics)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Estabilishes a CQL session with the database
    ///
    /// Usually it's easier to use [SessionBuilder](crate::client::session_builder::SessionBuilder)
    /// instead of calling `Session::connect` directly, because it's more convenient.
    /// # Arguments
    /// * `config` - Connection configuration - known nodes, Compression, etc.
    ///   Must contain at least one known node.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::error::Error;
    /// # async fn check_only_compiles() -> Result<(), Box<dyn Error>> {
    /// use quorum::client::session::{Session, SessionConfig};
    ///
    /// let mut config = SessionConfig::new();
    /// config.add_known_node("127.0.0.1:9042");
    ///
    /// let session: Session = Session::connect(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let keyspace = config
            .used_keyspace
            .clone()
            .map(|name| VerifiedKeyspaceName::new(name, config.keyspace_case_sensitive))
            .transpose()?;

        let (resolved, unresolved) =
            resolve_contact_points(&config.known_nodes, config.hostname_resolution_timeout).await;
        if resolved.is_empty() {
            return Err(NewSessionError::FailedToResolveAnyHostname(unresolved));
        }
        let hosts: Vec<Arc<Host>> = resolved.into_iter().map(Arc::new).collect();

        let metrics = Arc::new(Metrics::new());
        let host_status = Arc::new(HostStatusNotifier::new(config.host_listeners.clone()));
        let connection_config = config.connection_config();

        let pools: HashMap<SocketAddr, NodeConnectionPool> = hosts
            .iter()
            .map(|host| {
                let distance = config.load_balancing.distance(host);
                debug!(node_addr = %host.address(), ?distance, "Creating connection pool");
                let pool = NodeConnectionPool::new(
                    host.clone(),
                    distance,
                    PoolConfig {
                        connection_config: connection_config.clone(),
                        pooling: config.pooling.clone(),
                    },
                    keyspace.clone(),
                    host_status.clone(),
                    metrics.clone(),
                );
                (host.address(), pool)
            })
            .collect();

        join_all(pools.values().map(NodeConnectionPool::wait_until_initialized)).await;

        if pools.values().all(|pool| pool.connection_count() == 0) {
            let errors = pools
                .values()
                .filter_map(|pool| Some((pool.host().address(), pool.last_error()?)))
                .collect();
            return Err(NewSessionError::NoHostConnected(errors));
        }

        let event_listener = config.event_sender.clone().map(|event_sender| {
            let config = ConnectionConfig {
                event_sender: Some(event_sender),
                ..connection_config
            };
            let (fut, handle) = listen_for_events(hosts.clone(), config)
                .instrument(tracing::debug_span!("event_listener"))
                .remote_handle();
            tokio::spawn(fut);
            handle
        });

        info!(
            hosts = hosts.len(),
            keyspace = ?config.used_keyspace,
            load_balancing = %config.load_balancing.name(),
            "Session connected"
        );

        Ok(Session {
            inner: Arc::new(SessionInner {
                hosts,
                pools,
                load_balancing: config.load_balancing,
                retry_policy: config.retry_policy,
                client_timeout_retry: config.client_timeout_retry,
                consistency: config.consistency,
                serial_consistency: config.serial_consistency,
                request_timeout: config.request_timeout,
                keyspace: ArcSwapOption::from(keyspace.map(Arc::new)),
                metrics,
                host_status,
                schema_agreement_waiter: config.schema_agreement_waiter,
                schema_agreement_timeout: config.schema_agreement_timeout,
                schema_agreement_automatic_waiting: config.schema_agreement_automatic_waiting,
                _event_listener: event_listener,
            }),
        })
    }

    /// Shorthand for [`SessionBuilder::new`].
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Sends a request to the database and receives a response.\
    /// Executes an unprepared statement without paging, i.e. all results are received in a single response.
    ///
    /// This is the easiest way to execute a statement, but performance is worse than that of prepared
    /// statements.
    ///
    /// It is discouraged to use this method with non-empty values argument: every node has to
    /// parse the statement text every time. Prepare the statement with [`Session::prepare`] instead.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use quorum::client::session::Session;
    /// # use std::error::Error;
    /// # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
    /// use quorum::values::SerializedValues;
    ///
    /// let mut values = SerializedValues::new();
    /// values.add_value(2_i32.to_be_bytes().to_vec());
    /// session
    ///     .query_unpaged("INSERT INTO ks.tab (a) VALUES(?)", &values)
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query_unpaged(
        &self,
        statement: impl Into<Statement>,
        values: &SerializedValues,
    ) -> Result<QueryResult, ExecutionError> {
        let statement = statement.into();
        let executed = self
            .inner
            .run(ExecutionRequest::Query {
                statement: &statement,
                values,
                page: None,
            })
            .await?;
        self.inner.finish(executed).await.map(|(result, _)| result)
    }

    /// Queries a single page from the database, optionally continuing from a saved point.
    ///
    /// The page size is the statement's; the returned [`PagingStateResponse`]
    /// tells whether there are more pages and how to fetch the next one.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use quorum::client::session::Session;
    /// # use std::error::Error;
    /// # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
    /// use std::ops::ControlFlow;
    /// use quorum::response::PagingState;
    /// use quorum::values::SerializedValues;
    ///
    /// let mut paging_state = PagingState::start();
    /// loop {
    ///    let (res, paging_state_response) = session
    ///        .query_single_page("SELECT a, b FROM ks.t", SerializedValues::EMPTY, paging_state)
    ///        .await?;
    ///
    ///    println!("Page with {:?} rows", res.rows_num());
    ///
    ///    match paging_state_response.into_paging_control_flow() {
    ///        ControlFlow::Break(()) => {
    ///            // No more pages to be fetched.
    ///            break;
    ///        }
    ///        ControlFlow::Continue(new_paging_state) => {
    ///            // Update paging state from the response, so that query
    ///            // will be resumed from where it ended the last time.
    ///            paging_state = new_paging_state;
    ///        }
    ///    }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query_single_page(
        &self,
        statement: impl Into<Statement>,
        values: &SerializedValues,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), ExecutionError> {
        let statement = statement.into();
        let page_size = validate_page_size(statement.get_page_size())?;
        let executed = self
            .inner
            .run(ExecutionRequest::Query {
                statement: &statement,
                values,
                page: Some(PageRequest {
                    page_size,
                    paging_state,
                }),
            })
            .await?;
        self.inner.finish(executed).await
    }

    /// Run an unprepared statement with paging.\
    /// This method will query all pages of the result.\
    ///
    /// Returns a [`QueryPager`], an async stream of pages. Pages are fetched
    /// one after another, each one as an independent request with its own host
    /// plan. The first page is fetched before this method returns, so errors
    /// of the first request are returned here.
    pub async fn query_iter(
        &self,
        statement: impl Into<Statement>,
        values: SerializedValues,
    ) -> Result<QueryPager, ExecutionError> {
        let statement = statement.into();
        let page_size = validate_page_size(statement.get_page_size())?;
        QueryPager::new(
            self.inner.clone(),
            PagerRequest::Query { statement, values },
            page_size,
        )
        .await
    }

    /// Prepares a statement on the server side and returns a prepared statement,
    /// which can later be used to perform more efficient requests.
    ///
    /// The statement is prepared on the first host of its plan only. Other
    /// hosts learn it the first time they are asked to execute it: they answer
    /// that the statement is unknown and the driver prepares it again there,
    /// transparently.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use quorum::client::session::Session;
    /// # use std::error::Error;
    /// # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
    /// use quorum::statement::PreparedStatement;
    /// use quorum::values::SerializedValues;
    ///
    /// // Prepare the statement for later execution
    /// let prepared: PreparedStatement = session
    ///     .prepare("INSERT INTO ks.tab (a) VALUES(?)")
    ///     .await?;
    ///
    /// // Run the prepared statement with some values, just like a simple statement.
    /// let mut values = SerializedValues::new();
    /// values.add_value(12345_i32.to_be_bytes().to_vec());
    /// session.execute_unpaged(&prepared, &values).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn prepare(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<PreparedStatement, ExecutionError> {
        let statement = statement.into();
        let executed = self
            .inner
            .run(ExecutionRequest::Prepare {
                statement: &statement,
            })
            .await?;

        match executed.result {
            RunRequestResult::Completed(NonErrorQueryResponse {
                response: NonErrorResponse::Result(result::Result::Prepared(prepared)),
                ..
            }) => {
                debug!(
                    node_addr = %executed.coordinator,
                    statement = statement.contents,
                    "Statement prepared"
                );
                Ok(PreparedStatement::from_prepared(prepared.id, &statement))
            }
            RunRequestResult::Completed(response) => Err(ExecutionError::LastAttemptError(
                RequestAttemptError::UnexpectedResponse(response.response.kind()),
            )),
            RunRequestResult::IgnoredWriteError => Err(ExecutionError::LastAttemptError(
                RequestAttemptError::UnexpectedResponse(CqlResponseKind::Result),
            )),
        }
    }

    /// Execute a prepared statement. Requires a [PreparedStatement]
    /// generated using [`Session::prepare`](Session::prepare).\
    /// Performs an unpaged request, i.e. all results are received in a single response.
    pub async fn execute_unpaged(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
    ) -> Result<QueryResult, ExecutionError> {
        let executed = self
            .inner
            .run(ExecutionRequest::Execute {
                prepared,
                values,
                page: None,
            })
            .await?;
        self.inner.finish(executed).await.map(|(result, _)| result)
    }

    /// Executes a prepared statement, restricting results to single page.
    /// Optionally continues fetching results from a saved point.
    ///
    /// See [`Session::query_single_page`] for paging through the results.
    pub async fn execute_single_page(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), ExecutionError> {
        let page_size = validate_page_size(prepared.get_page_size())?;
        let executed = self
            .inner
            .run(ExecutionRequest::Execute {
                prepared,
                values,
                page: Some(PageRequest {
                    page_size,
                    paging_state,
                }),
            })
            .await?;
        self.inner.finish(executed).await
    }

    /// Run a prepared statement with paging.\
    /// This method will query all pages of the result.\
    ///
    /// Returns an async stream of pages, see [`Session::query_iter`].
    pub async fn execute_iter(
        &self,
        prepared: PreparedStatement,
        values: SerializedValues,
    ) -> Result<QueryPager, ExecutionError> {
        let page_size = validate_page_size(prepared.get_page_size())?;
        QueryPager::new(
            self.inner.clone(),
            PagerRequest::Execute { prepared, values },
            page_size,
        )
        .await
    }

    /// Perform a batch request.\
    /// Batch contains many `simple` or `prepared` statements which are executed as one.
    ///
    /// `values[i]` is bound to the i-th statement of the batch; statements
    /// past the end of `values` are sent without values.
    ///
    /// Batches cannot be paged.
    pub async fn batch(
        &self,
        batch: &Batch,
        values: &[SerializedValues],
    ) -> Result<QueryResult, ExecutionError> {
        let statements = batch.statements.len();
        if statements > u16::MAX as usize {
            return Err(BadQuery::TooManyQueriesInBatchStatement(statements).into());
        }
        if values.len() > statements {
            return Err(BadQuery::TooManyBatchValues {
                statements,
                values: values.len(),
            }
            .into());
        }

        let executed = self
            .inner
            .run(ExecutionRequest::Batch { batch, values })
            .await?;
        self.inner.finish(executed).await.map(|(result, _)| result)
    }

    /// Sends `USE <keyspace_name>` request on all connections\
    /// This allows to write `SELECT * FROM table` instead of `SELECT * FROM keyspace.table`\
    ///
    /// Note that even failed `use_keyspace` can change currently used keyspace - the request is sent on all connections and
    /// can overwrite previously used keyspace.
    ///
    /// Call only one `use_keyspace` at a time.\
    /// Trying to do two `use_keyspace` requests simultaneously with different names
    /// can end with some connections using one keyspace and the rest using the other.
    ///
    /// # Arguments
    ///
    /// * `keyspace_name` - keyspace name to use,
    ///   keyspace names can have up to 48 alphanumeric characters and contain underscores
    /// * `case_sensitive` - if set to true the generated statement will put keyspace name in quotes
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        let keyspace_name = VerifiedKeyspaceName::new(keyspace_name.into(), case_sensitive)?;
        self.inner.use_keyspace(keyspace_name).await
    }

    /// Keyspace currently used by the session's connections.
    pub fn get_keyspace(&self) -> Option<String> {
        self.inner
            .keyspace
            .load()
            .as_deref()
            .map(|keyspace| keyspace.as_str().to_owned())
    }

    /// Waits until every reachable host reports the same schema version,
    /// bounded by the configured schema agreement timeout.
    pub async fn await_schema_agreement(&self) -> Result<Uuid, SchemaAgreementError> {
        self.inner.await_schema_agreement().await
    }

    /// Returns the agreed schema version, or `None` if reachable hosts disagree.
    pub async fn check_schema_agreement(&self) -> Result<Option<Uuid>, SchemaAgreementError> {
        let versions = self.inner.schema_versions().await?;
        Ok(agreed_version(&versions))
    }

    /// Access metrics collected by the driver\
    /// Driver collects various metrics like number of queries or query latencies.
    /// They can be read using this method
    pub fn get_metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Hosts the session sends requests to, as resolved from the known nodes.
    pub fn get_hosts(&self) -> &[Arc<Host>] {
        &self.inner.hosts
    }
}

impl SessionInner {
    pub(crate) async fn run(
        &self,
        request: ExecutionRequest<'_>,
    ) -> Result<Executed, ExecutionError> {
        RequestExecution::new(self, request).run().await
    }

    /// Applies the side effects of a successful response and turns it into a result page.
    pub(crate) async fn finish(
        self: &Arc<Self>,
        executed: Executed,
    ) -> Result<(QueryResult, PagingStateResponse), ExecutionError> {
        let Executed {
            result,
            coordinator,
        } = executed;
        let response = match result {
            RunRequestResult::Completed(response) => response,
            RunRequestResult::IgnoredWriteError => {
                return Ok((
                    QueryResult::void().with_coordinator(coordinator),
                    PagingStateResponse::NoMorePages,
                ))
            }
        };

        if let Some(set_keyspace) = response.as_set_keyspace() {
            debug!(
                keyspace = set_keyspace.keyspace_name,
                "Keyspace changed by a USE statement, applying it to every connection"
            );
            let keyspace_name = VerifiedKeyspaceName::new(set_keyspace.keyspace_name.clone(), true)
                .map_err(UseKeyspaceError::from)?;
            self.use_keyspace(keyspace_name).await?;
        }

        if response.as_schema_change().is_some() && self.schema_agreement_automatic_waiting {
            debug!(node_addr = %coordinator, "Schema changed, awaiting schema agreement");
            self.await_schema_agreement().await?;
        }

        let (result, paging_state_response) = response.into_query_result_and_paging_state()?;
        Ok((result.with_coordinator(coordinator), paging_state_response))
    }

    async fn use_keyspace(&self, keyspace_name: VerifiedKeyspaceName) -> Result<(), UseKeyspaceError> {
        self.keyspace.store(Some(Arc::new(keyspace_name.clone())));
        let results = join_all(
            self.pools
                .values()
                .map(|pool| pool.use_keyspace(keyspace_name.clone())),
        )
        .await;
        use_keyspace_result(results.into_iter())
    }

    /// Runs the schema agreement waiter on a separate task, bounded by the timeout.
    async fn await_schema_agreement(self: &Arc<Self>) -> Result<Uuid, SchemaAgreementError> {
        let session = Arc::clone(self);
        let timeout = self.schema_agreement_timeout;
        let task = tokio::spawn(async move {
            let source: &dyn SchemaVersionSource = session.as_ref();
            tokio::time::timeout(
                timeout,
                session.schema_agreement_waiter.wait_for_agreement(source),
            )
            .await
            .unwrap_or(Err(SchemaAgreementError::Timeout(timeout)))
        });
        task.await
            .unwrap_or(Err(SchemaAgreementError::TaskCancelled))
    }
}

#[async_trait]
impl SchemaVersionSource for SessionInner {
    async fn schema_versions(&self) -> Result<Vec<(SocketAddr, Uuid)>, SchemaAgreementError> {
        let per_host = self.pools.values().map(|pool| async move {
            for connection in pool.connections() {
                match connection.fetch_schema_version().await {
                    Ok(version) => return Some(Ok((pool.host().address(), version))),
                    // Another connection of the host may still answer.
                    Err(SchemaAgreementError::RequestError(
                        RequestAttemptError::BrokenConnectionError(_),
                    )) => continue,
                    Err(err) => return Some(Err(err)),
                }
            }
            None
        });

        let versions = join_all(per_host)
            .await
            .into_iter()
            .flatten()
            .collect::<Result<Vec<_>, _>>()?;
        if versions.is_empty() {
            return Err(SchemaAgreementError::NoConnections);
        }
        Ok(versions)
    }
}

// Backoff of reconnecting the event connection.
const MIN_EVENT_RECONNECT_DELAY: Duration = Duration::from_millis(100);
const MAX_EVENT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Keeps one connection registered for server events, moving to the next
/// host whenever it breaks. Ends once the receiving side of the events is gone.
async fn listen_for_events(hosts: Vec<Arc<Host>>, config: ConnectionConfig) {
    let mut delay = MIN_EVENT_RECONNECT_DELAY;
    for host in hosts.iter().cycle() {
        if config
            .event_sender
            .as_ref()
            .is_none_or(mpsc::Sender::is_closed)
        {
            debug!("Event receiver dropped, stopping");
            return;
        }

        match open_connection(host.address(), &config, None).await {
            Ok((_connection, error_receiver)) => {
                debug!(node_addr = %host.address(), "Listening for events");
                delay = MIN_EVENT_RECONNECT_DELAY;
                match error_receiver.await {
                    Ok(err) => warn!(node_addr = %host.address(), error = %err, "Event connection broke"),
                    Err(_) => warn!(node_addr = %host.address(), "Event connection closed"),
                }
            }
            Err(err) => {
                warn!(
                    node_addr = %host.address(),
                    error = %err,
                    "Failed to open event connection"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_EVENT_RECONNECT_DELAY);
            }
        }
    }
}
