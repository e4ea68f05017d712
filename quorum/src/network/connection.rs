//! A single connection to a node.
//!
//! Many requests are in flight on one socket at the same time. Each of them
//! owns a stream id from a fixed arena for as long as it waits for its
//! response; the reader task hands every response back to the caller that
//! owns its stream id. A single writer task serializes frames onto the socket.

use std::borrow::Cow;
use std::cmp::Ordering as StreamOrdering;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use quorum_cql::frame::request::options::{self, Options};
use quorum_cql::frame::request::query::QueryParameters;
use quorum_cql::frame::request::{self, RequestOpcode, SerializableRequest};
use quorum_cql::frame::response::authenticate::Authenticate;
use quorum_cql::frame::response::event::{Event, EventType};
use quorum_cql::frame::response::{result, NonErrorResponse, Response, ResponseOpcode, Supported};
use quorum_cql::frame::{self, Compression, FrameParams, ProtocolVersion, SerializedRequest};
use quorum_cql::frame::types;
use quorum_cql::values::SerializedValues;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn, Instrument};
use uuid::Uuid;

use super::tls::TlsContext;
use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    ConnectionSetupRequestError, ConnectionSetupRequestErrorKind, CqlEventHandlingError,
    RequestAttemptError, SchemaAgreementError, UseKeyspaceError,
};
use crate::response::{NonErrorAuthResponse, NonErrorStartupResponse, QueryResponse};
use crate::statement::{Batch, BatchStatement, PreparedStatement, Statement};
use crate::{Consistency, SerialConsistency};

// Query for schema agreement
const LOCAL_VERSION: &str = "SELECT schema_version FROM system.local WHERE key='local'";

/// Stream ids available to one connection unless configured otherwise.
pub(crate) const DEFAULT_MAX_STREAM_IDS: usize = 128;

/// Upper bound of the stream id namespace of protocol v3/v4.
const MAX_STREAM_ID_SPACE: usize = i16::MAX as usize + 1;

/// Health of a connection. Setup goes `Connecting -> [Authenticating ->] Ready`.
/// `Faulted` and `Disposed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnectionState {
    Connecting = 0,
    Authenticating = 1,
    Ready = 2,
    /// An I/O or protocol error was observed.
    Faulted = 3,
    /// Closed on purpose.
    Disposed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::Ready,
            3 => ConnectionState::Faulted,
            _ => ConnectionState::Disposed,
        }
    }

    fn is_final(self) -> bool {
        matches!(self, ConnectionState::Faulted | ConnectionState::Disposed)
    }
}

/// Settings of a single connection, derived from the session configuration.
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    /// Requested compression; dropped if the node does not support it.
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    /// Applies to setup requests. Statement requests pass their own.
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) keepalive_timeout: Option<Duration>,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    pub(crate) tls_context: Option<TlsContext>,
    /// If set, the connection REGISTERs for every event type and forwards events here.
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
    pub(crate) max_stream_ids: usize,
    /// Version proposed first. Lower ones are tried if the node rejects it.
    pub(crate) protocol_version: ProtocolVersion,
    /// Lets the writer wait a scheduler tick for more requests before flushing.
    pub(crate) write_coalescing: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
            keepalive_interval: None,
            keepalive_timeout: None,
            authenticator: None,
            tls_context: None,
            event_sender: None,
            max_stream_ids: DEFAULT_MAX_STREAM_IDS,
            protocol_version: ProtocolVersion::default(),
            write_coalescing: true,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("compression", &self.compression)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("authenticator", &self.authenticator.as_ref().map(|_| "..."))
            .field("tls_context", &self.tls_context)
            .field("event_sender", &self.event_sender.is_some())
            .field("max_stream_ids", &self.max_stream_ids)
            .field("protocol_version", &self.protocol_version)
            .field("write_coalescing", &self.write_coalescing)
            .finish()
    }
}

/// Receives the error that broke the connection, or `Closed` after [`Connection::close`].
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

type ResponseHandler = oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>;

struct Task {
    serialized_request: SerializedRequest,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

/// Fixed arena of stream ids with a free list.
struct StreamTable {
    handlers: Vec<Option<ResponseHandler>>,
    free: Vec<i16>,
    /// Set once the connection is broken. No id is handed out afterwards.
    closed: Option<BrokenConnectionError>,
}

impl StreamTable {
    fn new(max_stream_ids: usize) -> Self {
        let capacity = max_stream_ids.clamp(1, MAX_STREAM_ID_SPACE);
        Self {
            handlers: (0..capacity).map(|_| None).collect(),
            // Popped from the back, so lower ids are used first.
            free: (0..capacity).rev().map(|id| id as i16).collect(),
            closed: None,
        }
    }

    fn allocate(&mut self, handler: ResponseHandler) -> Result<i16, RequestAttemptError> {
        if let Some(error) = &self.closed {
            return Err(error.clone().into());
        }
        let stream_id = self
            .free
            .pop()
            .ok_or(RequestAttemptError::StreamsExhausted)?;
        self.handlers[stream_id as usize] = Some(handler);
        Ok(stream_id)
    }

    fn release(&mut self, stream_id: i16) -> Option<ResponseHandler> {
        let slot = self.handlers.get_mut(usize::try_from(stream_id).ok()?)?;
        let handler = slot.take()?;
        self.free.push(stream_id);
        Some(handler)
    }

    fn in_use(&self) -> usize {
        self.handlers.len() - self.free.len()
    }

    fn capacity(&self) -> usize {
        self.handlers.len()
    }

    fn close(&mut self, error: BrokenConnectionError) -> Vec<ResponseHandler> {
        self.closed.get_or_insert(error);
        self.handlers.iter_mut().filter_map(Option::take).collect()
    }
}

/// State shared by the connection object, its callers and its router task.
struct ConnectionShared {
    streams: StdMutex<StreamTable>,
    in_flight: AtomicUsize,
    capacity: usize,
    state: AtomicU8,
}

impl ConnectionShared {
    fn new(max_stream_ids: usize) -> Self {
        let streams = StreamTable::new(max_stream_ids);
        Self {
            capacity: streams.capacity(),
            streams: StdMutex::new(streams),
            in_flight: AtomicUsize::new(0),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
        }
    }

    // The lock is never held across an await point.
    fn lock_streams(&self) -> MutexGuard<'_, StreamTable> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self, handler: ResponseHandler) -> Result<i16, RequestAttemptError> {
        let mut streams = self.lock_streams();
        let stream_id = streams.allocate(handler)?;
        self.in_flight.store(streams.in_use(), Ordering::Relaxed);
        Ok(stream_id)
    }

    fn release(&self, stream_id: i16) -> Option<ResponseHandler> {
        let mut streams = self.lock_streams();
        let handler = streams.release(stream_id);
        self.in_flight.store(streams.in_use(), Ordering::Relaxed);
        handler
    }

    fn closed_error(&self) -> BrokenConnectionError {
        self.lock_streams()
            .closed
            .clone()
            .unwrap_or_else(|| BrokenConnectionErrorKind::ChannelError.into())
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, new_state: ConnectionState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = ConnectionState::from_u8(current);
                match (current, new_state) {
                    (ConnectionState::Disposed, _) => None,
                    (ConnectionState::Faulted, ConnectionState::Disposed) => {
                        Some(new_state as u8)
                    }
                    (ConnectionState::Faulted, _) => None,
                    _ => Some(new_state as u8),
                }
            });
    }

    /// Completes every pending request with `error`, exactly once each,
    /// and stops handing out stream ids.
    fn fail_all(&self, error: BrokenConnectionError, state: ConnectionState) {
        self.set_state(state);
        let handlers = {
            let mut streams = self.lock_streams();
            let handlers = streams.close(error.clone());
            self.in_flight.store(0, Ordering::Relaxed);
            handlers
        };
        if !handlers.is_empty() {
            debug!(
                pending = handlers.len(),
                error = %error,
                "Failing requests pending on a broken connection"
            );
        }
        for handler in handlers {
            // The caller may have given up waiting already.
            let _ = handler.send(Err(error.clone()));
        }
    }
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
    shared: Arc<ConnectionShared>,
    fault_sender: mpsc::UnboundedSender<BrokenConnectionError>,
    protocol_version: ProtocolVersion,
}

impl RouterHandle {
    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
        tracing: bool,
        request_timeout: Option<Duration>,
    ) -> Result<TaskResponse, RequestAttemptError> {
        let mut serialized_request =
            SerializedRequest::make(request, self.protocol_version, compression, tracing)?;

        // No stream id is taken until the writer has room, so a caller
        // dropped while waiting here leaves the arena untouched.
        let permit = match self.submit_channel.reserve().await {
            Ok(permit) => permit,
            Err(_) => return Err(self.shared.closed_error().into()),
        };

        let (response_sender, receiver) = oneshot::channel();
        let stream_id = self.shared.allocate(response_sender)?;
        serialized_request.set_stream(stream_id);
        permit.send(Task { serialized_request });

        let response = match request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(response) => response,
                Err(_) => {
                    warn!(
                        stream_id,
                        timeout = ?timeout,
                        "Request was not answered in time, breaking the connection"
                    );
                    let error = BrokenConnectionError::from(
                        BrokenConnectionErrorKind::RequestTimeout(timeout),
                    );
                    self.shared.fail_all(error.clone(), ConnectionState::Faulted);
                    let _ = self.fault_sender.send(error);
                    return Err(RequestAttemptError::RequestTimeout(timeout));
                }
            },
            None => receiver.await,
        };

        match response {
            Ok(result) => result.map_err(RequestAttemptError::from),
            Err(_) => Err(BrokenConnectionError::from(BrokenConnectionErrorKind::ChannelError).into()),
        }
    }
}

/// Parts of the configuration the router task needs.
struct RouterSettings {
    event_sender: Option<mpsc::Sender<Event>>,
    compression: Option<Compression>,
    keepalive_interval: Option<Duration>,
    keepalive_timeout: Option<Duration>,
    write_coalescing: bool,
}

pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    protocol_version: ProtocolVersion,
    /// Negotiated compression.
    compression: Option<Compression>,
    router_handle: Arc<RouterHandle>,
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Opens the socket and starts the router, without sending any frame yet.
    async fn new(
        connect_address: SocketAddr,
        config: ConnectionConfig,
        protocol_version: ProtocolVersion,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream = match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(connect_address),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout),
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        // Unbounded, so a timed out caller can report without awaiting.
        let (fault_sender, fault_receiver) = mpsc::unbounded_channel();

        let shared = Arc::new(ConnectionShared::new(config.max_stream_ids));
        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            shared: shared.clone(),
            fault_sender,
            protocol_version,
        });

        let settings = RouterSettings {
            event_sender: config.event_sender.clone(),
            compression: config.compression,
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            write_coalescing: config.write_coalescing,
        };

        let _worker_handle = match &config.tls_context {
            Some(tls_context) => {
                let stream = tls_context.connect(stream, connect_address.ip()).await?;
                Self::spawn_router(
                    stream,
                    receiver,
                    fault_receiver,
                    error_sender,
                    router_handle.clone(),
                    connect_address,
                    settings,
                )
            }
            None => Self::spawn_router(
                stream,
                receiver,
                fault_receiver,
                error_sender,
                router_handle.clone(),
                connect_address,
                settings,
            ),
        };

        let connection = Connection {
            _worker_handle,
            connect_address,
            compression: config.compression,
            config,
            protocol_version,
            router_handle,
            shared,
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is the idle time before probes start, which socket2 calls "time".
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        SockRef::from(stream).set_tcp_keepalive(&tcp_keepalive)
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub(crate) fn compression(&self) -> Option<Compression> {
        self.compression
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// A connection is healthy until it faults or is closed.
    pub(crate) fn is_healthy(&self) -> bool {
        !self.shared.state().is_final()
    }

    /// Number of requests waiting for a response.
    pub(crate) fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn max_streams(&self) -> usize {
        self.shared.capacity
    }

    pub(crate) fn has_free_streams(&self) -> bool {
        self.in_flight() < self.max_streams()
    }

    /// Fails every pending request with `Closed` and stops the router.
    pub(crate) fn close(&self) {
        let error = BrokenConnectionError::from(BrokenConnectionErrorKind::Closed);
        self.shared.fail_all(error.clone(), ConnectionState::Disposed);
        let _ = self.router_handle.fault_sender.send(error);
    }

    /// Sends a setup request and turns an ERROR answer into a setup error.
    async fn setup_request(
        &self,
        request: &impl SerializableRequest,
        request_kind: RequestOpcode,
        compress: bool,
    ) -> Result<Response, ConnectionSetupRequestError> {
        let response = self
            .send_request(request, compress, false, self.config.request_timeout)
            .await
            .map_err(|err| ConnectionSetupRequestError::new(request_kind, err.into()))?;

        match response.response {
            Response::Error(error) => Err(ConnectionSetupRequestError::new(
                request_kind,
                ConnectionSetupRequestErrorKind::DbError(error.error, error.reason),
            )),
            other => Ok(other),
        }
    }

    async fn get_options(&self) -> Result<Supported, ConnectionSetupRequestError> {
        match self
            .setup_request(&Options, RequestOpcode::Options, false)
            .await?
        {
            Response::Supported(supported) => Ok(supported),
            other => Err(ConnectionSetupRequestError::new(
                RequestOpcode::Options,
                ConnectionSetupRequestErrorKind::UnexpectedResponse(other.kind()),
            )),
        }
    }

    async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<NonErrorStartupResponse, ConnectionSetupRequestError> {
        match self
            .setup_request(&request::Startup { options }, RequestOpcode::Startup, false)
            .await?
        {
            Response::Ready => Ok(NonErrorStartupResponse::Ready),
            Response::Authenticate(authenticate) => {
                Ok(NonErrorStartupResponse::Authenticate(authenticate))
            }
            other => Err(ConnectionSetupRequestError::new(
                RequestOpcode::Startup,
                ConnectionSetupRequestErrorKind::UnexpectedResponse(other.kind()),
            )),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::AuthResponse, kind)
        };

        let authenticator_provider = self
            .config
            .authenticator
            .as_ref()
            .ok_or_else(|| err(ConnectionSetupRequestErrorKind::MissingAuthentication))?;

        let (mut response, mut auth_session) = authenticator_provider
            .start_authentication_session(&authenticate.authenticator_name)
            .await
            .map_err(|e| err(ConnectionSetupRequestErrorKind::StartAuthSessionError(e)))?;

        loop {
            match self.authenticate_response(response).await? {
                NonErrorAuthResponse::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(|e| {
                            err(ConnectionSetupRequestErrorKind::AuthChallengeEvaluationError(e))
                        })?;
                }
                NonErrorAuthResponse::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthFinishError(e)))?;
                    return Ok(());
                }
            }
        }
    }

    async fn authenticate_response(
        &self,
        response: Option<Vec<u8>>,
    ) -> Result<NonErrorAuthResponse, ConnectionSetupRequestError> {
        match self
            .setup_request(
                &request::AuthResponse { response },
                RequestOpcode::AuthResponse,
                false,
            )
            .await?
        {
            Response::AuthSuccess(success) => Ok(NonErrorAuthResponse::AuthSuccess(success)),
            Response::AuthChallenge(challenge) => {
                Ok(NonErrorAuthResponse::AuthChallenge(challenge))
            }
            other => Err(ConnectionSetupRequestError::new(
                RequestOpcode::AuthResponse,
                ConnectionSetupRequestErrorKind::UnexpectedResponse(other.kind()),
            )),
        }
    }

    async fn register(
        &self,
        event_types_to_register_for: Vec<EventType>,
    ) -> Result<(), ConnectionSetupRequestError> {
        let register = request::Register {
            event_types_to_register_for,
        };
        match self
            .setup_request(&register, RequestOpcode::Register, true)
            .await?
        {
            Response::Ready => Ok(()),
            other => Err(ConnectionSetupRequestError::new(
                RequestOpcode::Register,
                ConnectionSetupRequestErrorKind::UnexpectedResponse(other.kind()),
            )),
        }
    }

    /// Runs an unprepared statement with the given parameters.
    pub(crate) async fn query_raw(
        &self,
        statement: &Statement,
        parameters: QueryParameters<'_>,
        request_timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query = request::Query {
            contents: Cow::Borrowed(&statement.contents),
            parameters,
        };
        self.send_request(&query, true, statement.config.tracing, request_timeout)
            .await
    }

    /// Runs a prepared statement by its id.
    pub(crate) async fn execute_raw(
        &self,
        prepared: &PreparedStatement,
        parameters: QueryParameters<'_>,
        request_timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let execute = request::Execute {
            id: prepared.get_id().clone(),
            parameters,
        };
        self.send_request(&execute, true, prepared.config.tracing, request_timeout)
            .await
    }

    /// Runs a batch. `values[i]` is bound to the i-th statement; missing ones are empty.
    pub(crate) async fn batch_raw(
        &self,
        batch: &Batch,
        values: &[SerializedValues],
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        request_timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let statements = batch
            .statements
            .iter()
            .enumerate()
            .map(|(i, statement)| {
                let statement = match statement {
                    BatchStatement::Query(query) => request::batch::BatchStatement::Query {
                        text: Cow::Borrowed(query.contents.as_str()),
                    },
                    BatchStatement::PreparedStatement(prepared) => {
                        request::batch::BatchStatement::Prepared {
                            id: prepared.get_id().clone(),
                        }
                    }
                };
                let values = Cow::Borrowed(values.get(i).unwrap_or(SerializedValues::EMPTY));
                (statement, values)
            })
            .collect();

        let batch_frame = request::Batch {
            batch_type: batch.get_type(),
            statements,
            consistency,
            serial_consistency,
            timestamp: batch.config.timestamp,
        };
        self.send_request(&batch_frame, true, batch.config.tracing, request_timeout)
            .await
    }

    /// Sends PREPARE and returns the response as is.
    pub(crate) async fn prepare_raw(
        &self,
        statement: &Statement,
        request_timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let prepare = request::Prepare {
            query: Cow::Borrowed(&statement.contents),
        };
        self.send_request(&prepare, true, statement.config.tracing, request_timeout)
            .await
    }

    pub(crate) async fn prepare(
        &self,
        statement: &Statement,
    ) -> Result<PreparedStatement, RequestAttemptError> {
        let request_timeout = statement
            .config
            .request_timeout
            .or(self.config.request_timeout);
        let response = self
            .prepare_raw(statement, request_timeout)
            .await?
            .into_non_error_query_response()?;

        match response.response {
            NonErrorResponse::Result(result::Result::Prepared(prepared)) => {
                Ok(PreparedStatement::from_prepared(prepared.id, statement))
            }
            other => Err(RequestAttemptError::UnexpectedResponse(other.kind())),
        }
    }

    /// Prepares `statement_text` again after the node reported it as unknown.
    /// The node must assign the same id as before.
    pub(crate) async fn reprepare(
        &self,
        statement_text: &str,
        expected_id: &Bytes,
    ) -> Result<(), RequestAttemptError> {
        let reprepared = self.prepare(&Statement::new(statement_text)).await?;
        if reprepared.get_id() != expected_id {
            return Err(RequestAttemptError::RepreparedIdChanged {
                statement: statement_text.to_owned(),
                expected_id: expected_id.clone(),
                reprepared_id: reprepared.get_id().clone(),
            });
        }
        debug!(
            node_addr = %self.connect_address,
            statement = statement_text,
            "Statement reprepared"
        );
        Ok(())
    }

    /// Runs a driver-internal query at consistency ONE.
    async fn query_internal(&self, text: &str) -> Result<QueryResponse, RequestAttemptError> {
        let query = request::Query {
            contents: Cow::Borrowed(text),
            parameters: QueryParameters {
                consistency: Consistency::One,
                ..Default::default()
            },
        };
        self.send_request(&query, true, false, self.config.request_timeout)
            .await
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        // Keyspace names cannot be bound as values, so the name goes into the text.
        let query = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()),
            false => format!("USE {}", keyspace_name.as_str()),
        };

        let response = self.query_internal(&query).await?;
        Self::verify_use_keyspace_result(keyspace_name, response)
    }

    fn verify_use_keyspace_result(
        keyspace_name: &VerifiedKeyspaceName,
        response: QueryResponse,
    ) -> Result<(), UseKeyspaceError> {
        let response = response.into_non_error_query_response()?;
        match response.as_set_keyspace() {
            Some(set_keyspace) => {
                if !set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace_name.as_str())
                {
                    return Err(UseKeyspaceError::KeyspaceNameMismatch {
                        expected_keyspace_name_lowercase: keyspace_name.as_str().to_lowercase(),
                        result_keyspace_name_lowercase: set_keyspace.keyspace_name.to_lowercase(),
                    });
                }
                Ok(())
            }
            None => Err(UseKeyspaceError::RequestError(
                RequestAttemptError::UnexpectedResponse(response.response.kind()),
            )),
        }
    }

    /// Schema version this node currently sees.
    pub(crate) async fn fetch_schema_version(&self) -> Result<Uuid, SchemaAgreementError> {
        let result = self
            .query_internal(LOCAL_VERSION)
            .await?
            .into_non_error_query_response()?
            .into_query_result()?;

        let row = match result.rows().next() {
            Some(Ok(row)) => row,
            _ => return Err(SchemaAgreementError::MalformedVersionRow),
        };
        match row.first() {
            Some(Some(raw_version)) => {
                let mut buf = *raw_version;
                types::read_uuid(&mut buf).map_err(|_| SchemaAgreementError::MalformedVersionRow)
            }
            _ => Err(SchemaAgreementError::MalformedVersionRow),
        }
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
        request_timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let compression = if compress { self.compression } else { None };

        let task_response = self
            .router_handle
            .send_request(request, compression, tracing, request_timeout)
            .await?;

        Self::parse_response(task_response, self.compression)
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(task_response.opcode, &mut &*body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            tracing_id: body_with_ext.trace_id,
            warnings: body_with_ext.warnings,
        })
    }

    fn spawn_router(
        stream: impl AsyncRead + AsyncWrite + Send + 'static,
        receiver: mpsc::Receiver<Task>,
        fault_receiver: mpsc::UnboundedReceiver<BrokenConnectionError>,
        error_sender: oneshot::Sender<ConnectionError>,
        router_handle: Arc<RouterHandle>,
        connect_address: SocketAddr,
        settings: RouterSettings,
    ) -> RemoteHandle<()> {
        let span = tracing::debug_span!("connection_router", node_addr = %connect_address);
        let (task, handle) = Self::router(
            stream,
            receiver,
            fault_receiver,
            error_sender,
            router_handle,
            connect_address.ip(),
            settings,
        )
        .instrument(span)
        .remote_handle();
        tokio::task::spawn(task);
        handle
    }

    async fn router(
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        fault_receiver: mpsc::UnboundedReceiver<BrokenConnectionError>,
        error_sender: oneshot::Sender<ConnectionError>,
        router_handle: Arc<RouterHandle>,
        node_address: IpAddr,
        settings: RouterSettings,
    ) {
        let shared = router_handle.shared.clone();
        let version = router_handle.protocol_version;
        let (read_half, write_half) = split(stream);

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &shared,
            version,
            settings.event_sender,
            settings.compression,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            receiver,
            settings.write_coalescing,
        );
        let f = Self::fault_watcher(fault_receiver);
        let k = Self::keepaliver(
            router_handle,
            settings.keepalive_interval,
            settings.keepalive_timeout,
            node_address,
        );

        let error: BrokenConnectionError = match futures::try_join!(r, w, f, k) {
            Ok(_) => BrokenConnectionErrorKind::Closed.into(),
            Err(err) => err,
        };

        let state = match error.kind() {
            BrokenConnectionErrorKind::Closed => ConnectionState::Disposed,
            _ => ConnectionState::Faulted,
        };
        debug!(error = %error, "Connection router finished");

        shared.fail_all(error.clone(), state);

        // Whoever watches this connection learns why it is gone.
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        shared: &ConnectionShared,
        version: ProtocolVersion,
        event_sender: Option<mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(BrokenConnectionErrorKind::FrameHeaderParseError)?;

            if params.protocol_version() != version.as_byte() {
                return Err(BrokenConnectionErrorKind::VersionMismatch {
                    expected: version.as_byte(),
                    received: params.protocol_version(),
                }
                .into());
            }

            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&frame::EVENT_STREAM_ID) {
                StreamOrdering::Less => {
                    // Other negative streams are reserved and never used.
                    continue;
                }
                StreamOrdering::Equal => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, compression, event_sender)
                            .await
                            .map_err(BrokenConnectionErrorKind::CqlEventHandlingError)?;
                    }
                    continue;
                }
                StreamOrdering::Greater => {}
            }

            match shared.release(params.stream) {
                Some(handler) => {
                    // The caller may have stopped waiting; its stream id is free now either way.
                    let _ = handler.send(Ok(response));
                }
                None => {
                    debug!(
                        stream_id = params.stream,
                        "Received response with unexpected stream id"
                    );
                    return Err(BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into());
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        mut task_receiver: mpsc::Receiver<Task>,
        write_coalescing: bool,
    ) -> Result<(), BrokenConnectionError> {
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            loop {
                let req_data = task.serialized_request.get_data();
                total_sent += req_data.len();
                num_requests += 1;
                write_half
                    .write_all(req_data)
                    .await
                    .map_err(BrokenConnectionErrorKind::WriteError)?;

                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) if write_coalescing => {
                        // One scheduler tick lets concurrent callers enqueue before the flush.
                        tokio::task::yield_now().await;
                        match task_receiver.try_recv() {
                            Ok(t) => t,
                            Err(_) => break,
                        }
                    }
                    Err(_) => break,
                };
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    /// Ends the router when a caller detects a fault, or the connection is closed.
    async fn fault_watcher(
        mut fault_receiver: mpsc::UnboundedReceiver<BrokenConnectionError>,
    ) -> Result<(), BrokenConnectionError> {
        match fault_receiver.recv().await {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn keepaliver(
        router_handle: Arc<RouterHandle>,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        node_address: IpAddr, // only used in log messages
    ) -> Result<(), BrokenConnectionError> {
        let Some(keepalive_interval) = keepalive_interval else {
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Use up the first, instant tick.

        // Default behaviour (Burst) is not suitable for sending keepalives.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let keepalive = router_handle.send_request(&Options, None, false, None);
            let result = match keepalive_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, keepalive).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            "Timed out while waiting for response to keepalive request on connection to node {}",
                            node_address
                        );
                        return Err(BrokenConnectionErrorKind::KeepaliveTimeout(node_address).into());
                    }
                },
                None => keepalive.await,
            };

            match result {
                Ok(_) => trace!(
                    "Keepalive request successful on connection to node {}",
                    node_address
                ),
                // Every stream is taken, so the connection is evidently alive.
                Err(RequestAttemptError::StreamsExhausted) => {}
                Err(err) => {
                    warn!(
                        "Failed to execute keepalive request on connection to node {} - {}",
                        node_address, err
                    );
                    return Err(BrokenConnectionErrorKind::KeepaliveRequestError(err).into());
                }
            }
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), CqlEventHandlingError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;
        let event = match Response::deserialize(task_response.opcode, &mut &*body_with_ext.body)? {
            Response::Event(event) => event,
            other => {
                warn!("Expected to receive Event response, got {:?}", other.kind());
                return Err(CqlEventHandlingError::UnexpectedResponse(other.kind()));
            }
        };

        event_sender
            .send(event)
            .await
            .map_err(|_| CqlEventHandlingError::SendError)
    }
}

/// Opens a connection and performs the whole handshake.
///
/// The node is first offered `config.protocol_version`; if it rejects it,
/// the connection is reopened with the next lower version.
pub(crate) async fn open_connection(
    addr: SocketAddr,
    config: &ConnectionConfig,
    keyspace: Option<&VerifiedKeyspaceName>,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let mut version = config.protocol_version;
    loop {
        match open_with_version(addr, config, version, keyspace).await {
            Err(err) if err.is_protocol_version_rejection() => match version.downgrade() {
                Some(lower) => {
                    debug!(
                        node_addr = %addr,
                        rejected = %version,
                        next = %lower,
                        "Node rejected protocol version, retrying with a lower one"
                    );
                    version = lower;
                }
                None => return Err(ConnectionError::ProtocolVersionRejected(version.as_byte())),
            },
            result => return result,
        }
    }
}

async fn open_with_version(
    addr: SocketAddr,
    config: &ConnectionConfig,
    version: ProtocolVersion,
    keyspace: Option<&VerifiedKeyspaceName>,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let (mut connection, error_receiver) = Connection::new(addr, config.clone(), version).await?;

    let supported = connection.get_options().await?;

    let mut options = HashMap::new();
    options.insert(
        Cow::Borrowed(options::CQL_VERSION),
        Cow::Borrowed(options::DEFAULT_CQL_VERSION),
    );
    options.insert(
        Cow::Borrowed(options::DRIVER_NAME),
        Cow::Borrowed(options::DEFAULT_DRIVER_NAME),
    );
    options.insert(
        Cow::Borrowed(options::DRIVER_VERSION),
        Cow::Borrowed(options::DEFAULT_DRIVER_VERSION),
    );

    if let Some(compression) = config.compression {
        if supported.supports_compression(compression) {
            options.insert(
                Cow::Borrowed(options::COMPRESSION),
                Cow::Borrowed(compression.as_str()),
            );
        } else {
            warn!(
                node_addr = %addr,
                "Requested compression <{}> is not supported by the node. Falling back to no compression",
                compression
            );
            connection.compression = None;
        }
    }

    match connection.startup(options).await? {
        NonErrorStartupResponse::Ready => {}
        NonErrorStartupResponse::Authenticate(authenticate) => {
            connection
                .shared
                .set_state(ConnectionState::Authenticating);
            connection.perform_authenticate(&authenticate).await?;
        }
    }

    if config.event_sender.is_some() {
        let all_event_types = vec![
            EventType::TopologyChange,
            EventType::StatusChange,
            EventType::SchemaChange,
        ];
        connection.register(all_event_types).await?;
    }

    if let Some(keyspace) = keyspace {
        connection.use_keyspace(keyspace).await.map_err(|err| {
            ConnectionSetupRequestError::new(
                RequestOpcode::Query,
                ConnectionSetupRequestErrorKind::UseKeyspace(Box::new(err)),
            )
        })?;
    }

    connection.shared.set_state(ConnectionState::Ready);
    debug!(
        node_addr = %addr,
        protocol_version = %version,
        compression = ?connection.compression,
        "Connection ready"
    );

    Ok((connection, error_receiver))
}

/// This type can only hold a valid keyspace name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Up to 48 characters out of [a-zA-Z0-9_]. Nodes accept a leading underscore too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let keyspace_name_len = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        if let Some(illegal) = keyspace_name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(BadKeyspaceName::IllegalCharacter(
                keyspace_name.to_string(),
                illegal,
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use quorum_cql::errors::DbError;
    use quorum_cql::frame::request::query::QueryParameters;
    use quorum_cql::frame::request::{options, Request, RequestOpcode};
    use quorum_cql::frame::response::event::{Event, StatusChangeEvent};
    use quorum_cql::frame::{Compression, ProtocolVersion};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{
        open_connection, Connection, ConnectionConfig, ConnectionState, VerifiedKeyspaceName,
        DEFAULT_MAX_STREAM_IDS, LOCAL_VERSION,
    };
    use crate::authentication::{
        AuthError, AuthenticatorProvider, AuthenticatorSession, PlainTextAuthenticator,
    };
    use crate::errors::{
        BadKeyspaceName, BrokenConnectionErrorKind, ConnectionError,
        ConnectionSetupRequestErrorKind, RequestAttemptError, UseKeyspaceError,
    };
    use crate::response::QueryResponse;
    use crate::statement::Statement;
    use crate::utils::test_utils::{
        setup_tracing, MockNode, Reaction, RequestFrame, ResponseFrame,
    };

    fn is_query(frame: &RequestFrame, text: &str) -> bool {
        frame.opcode == RequestOpcode::Query && frame.statement_text().as_deref() == Some(text)
    }

    fn rows_with_cell(cell: &[u8]) -> ResponseFrame {
        ResponseFrame::forged_rows(1, &[vec![Some(cell)]], None)
    }

    async fn run(
        connection: &Connection,
        text: &str,
        timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        connection
            .query_raw(&Statement::new(text), QueryParameters::default(), timeout)
            .await
    }

    fn first_cell(response: QueryResponse) -> Vec<u8> {
        let result = response
            .into_non_error_query_response()
            .unwrap()
            .into_query_result()
            .unwrap();
        let row = result.rows().next().unwrap().unwrap();
        row[0].unwrap().to_vec()
    }

    async fn wait_for_in_flight(connection: &Connection, expected: usize) {
        while connection.in_flight() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn responses_are_matched_to_their_callers() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| {
            if is_query(frame, "slow") {
                Reaction::delayed(Duration::from_millis(200), Reaction::Respond(rows_with_cell(b"slow")))
            } else if is_query(frame, "fast") {
                Reaction::Respond(rows_with_cell(b"fast"))
            } else {
                Reaction::Default
            }
        })
        .await;

        let (connection, _error_receiver) =
            open_connection(node.address(), &ConnectionConfig::default(), None)
                .await
                .unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);

        let (slow, fast) = tokio::join!(
            run(&connection, "slow", None),
            async {
                // Sent second, answered first.
                tokio::time::sleep(Duration::from_millis(20)).await;
                run(&connection, "fast", None).await
            }
        );
        assert_eq!(first_cell(slow.unwrap()), b"slow");
        assert_eq!(first_cell(fast.unwrap()), b"fast");
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn every_stream_id_in_use_is_matched_to_its_caller() {
        setup_tracing();
        const REQUESTS: usize = DEFAULT_MAX_STREAM_IDS;
        let node = MockNode::with_reactor(|frame| {
            let Some(index) = frame
                .statement_text()
                .and_then(|text| text.strip_prefix('q')?.parse::<u64>().ok())
            else {
                return Reaction::Default;
            };
            // Later requests are answered first.
            let delay = Duration::from_millis(5 * (REQUESTS as u64 - index));
            let cell = format!("q{index}");
            Reaction::delayed(delay, Reaction::Respond(rows_with_cell(cell.as_bytes())))
        })
        .await;

        let (connection, _error_receiver) =
            open_connection(node.address(), &ConnectionConfig::default(), None)
                .await
                .unwrap();
        let connection = &connection;

        let results = futures::future::join_all((0..REQUESTS).map(|index| async move {
            let text = format!("q{index}");
            let response = run(connection, &text, None).await;
            (text, response)
        }))
        .await;

        for (text, response) in results {
            assert_eq!(first_cell(response.unwrap()), text.as_bytes());
        }
        assert_eq!(connection.in_flight(), 0);
        assert!(connection.has_free_streams());
        assert!(connection.is_healthy());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn exhausted_stream_ids_fail_immediately() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| {
            if is_query(frame, "hang") {
                Reaction::Drop
            } else {
                Reaction::Default
            }
        })
        .await;

        let config = ConnectionConfig {
            max_stream_ids: 2,
            ..Default::default()
        };
        let (connection, _error_receiver) =
            open_connection(node.address(), &config, None).await.unwrap();
        let connection = Arc::new(connection);

        let mut hanging = Vec::new();
        for _ in 0..2 {
            let connection = connection.clone();
            hanging.push(tokio::spawn(async move {
                let _ = run(&connection, "hang", None).await;
            }));
        }
        wait_for_in_flight(&connection, 2).await;
        assert!(!connection.has_free_streams());

        let third = tokio::time::timeout(Duration::from_secs(1), run(&connection, "q", None))
            .await
            .expect("allocation must not wait for a free stream id");
        assert_matches!(third, Err(RequestAttemptError::StreamsExhausted));
        assert!(connection.is_healthy());

        for task in hanging {
            task.abort();
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn fault_fails_every_pending_request() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| {
            if is_query(frame, "hang") {
                Reaction::Drop
            } else if is_query(frame, "boom") {
                Reaction::Close
            } else {
                Reaction::Default
            }
        })
        .await;

        let (connection, error_receiver) =
            open_connection(node.address(), &ConnectionConfig::default(), None)
                .await
                .unwrap();
        let connection = Arc::new(connection);

        let pending: Vec<_> = (0..5)
            .map(|_| {
                let connection = connection.clone();
                tokio::spawn(async move { run(&connection, "hang", None).await })
            })
            .collect();
        wait_for_in_flight(&connection, 5).await;

        assert_matches!(
            run(&connection, "boom", None).await,
            Err(RequestAttemptError::BrokenConnectionError(_))
        );
        for request in pending {
            assert_matches!(
                request.await.unwrap(),
                Err(RequestAttemptError::BrokenConnectionError(_))
            );
        }

        assert_matches!(
            error_receiver.await,
            Ok(ConnectionError::BrokenConnection(_))
        );
        assert_eq!(connection.state(), ConnectionState::Faulted);
        assert_eq!(connection.in_flight(), 0);

        // Nothing can be sent on a faulted connection.
        assert_matches!(
            run(&connection, "q", None).await,
            Err(RequestAttemptError::BrokenConnectionError(_))
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn request_timeout_breaks_the_connection() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| {
            if is_query(frame, "hang") {
                Reaction::Drop
            } else {
                Reaction::Default
            }
        })
        .await;

        let (connection, error_receiver) =
            open_connection(node.address(), &ConnectionConfig::default(), None)
                .await
                .unwrap();
        let connection = Arc::new(connection);

        let bystander = {
            let connection = connection.clone();
            tokio::spawn(async move { run(&connection, "hang", None).await })
        };
        wait_for_in_flight(&connection, 1).await;

        let timeout = Duration::from_millis(100);
        assert_matches!(
            run(&connection, "hang", Some(timeout)).await,
            Err(RequestAttemptError::RequestTimeout(t)) if t == timeout
        );

        let bystander_error = assert_matches!(
            bystander.await.unwrap(),
            Err(RequestAttemptError::BrokenConnectionError(err)) => err
        );
        assert_matches!(
            bystander_error.kind(),
            BrokenConnectionErrorKind::RequestTimeout(_)
        );
        assert!(!connection.is_healthy());
        assert_matches!(
            error_receiver.await,
            Ok(ConnectionError::BrokenConnection(_))
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn rejected_protocol_version_is_downgraded() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| {
            if frame.params.version & 0x7F == 0x04 {
                Reaction::Respond(ResponseFrame::forged_error(
                    DbError::ProtocolError,
                    "Invalid or unsupported protocol version (4)",
                ))
            } else {
                Reaction::Default
            }
        })
        .await;

        let (connection, _error_receiver) =
            open_connection(node.address(), &ConnectionConfig::default(), None)
                .await
                .unwrap();
        assert_eq!(connection.protocol_version(), ProtocolVersion::V3);
        assert_eq!(node.accepted_connections(), 2);
        assert!(run(&connection, "q", None).await.is_ok());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn every_version_rejected() {
        setup_tracing();
        let node = MockNode::with_reactor(|_| {
            Reaction::Respond(ResponseFrame::forged_error(
                DbError::ProtocolError,
                "Invalid or unsupported protocol version",
            ))
        })
        .await;

        let result = open_connection(node.address(), &ConnectionConfig::default(), None).await;
        assert_matches!(result.err(), Some(ConnectionError::ProtocolVersionRejected(3)));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn response_with_other_version_is_fatal() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| {
            if is_query(frame, "q") {
                Reaction::Respond(ResponseFrame::forged_void().with_version(0x03))
            } else {
                Reaction::Default
            }
        })
        .await;

        let (connection, _error_receiver) =
            open_connection(node.address(), &ConnectionConfig::default(), None)
                .await
                .unwrap();
        let error = assert_matches!(
            run(&connection, "q", None).await,
            Err(RequestAttemptError::BrokenConnectionError(err)) => err
        );
        assert_matches!(
            error.kind(),
            BrokenConnectionErrorKind::VersionMismatch {
                expected: 4,
                received: 3
            }
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn compression_is_negotiated() {
        setup_tracing();
        let node = MockNode::start().await;
        let config = ConnectionConfig {
            compression: Some(Compression::Lz4),
            ..Default::default()
        };

        let (connection, _error_receiver) =
            open_connection(node.address(), &config, None).await.unwrap();
        assert_eq!(connection.compression(), Some(Compression::Lz4));
        // The node decompresses this body before answering it.
        assert!(run(&connection, "SELECT * FROM ks.t", None).await.is_ok());
        assert_eq!(node.received(RequestOpcode::Query), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unsupported_compression_falls_back_to_none() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| match frame.opcode {
            RequestOpcode::Options => Reaction::Respond(ResponseFrame::forged_supported(&[(
                options::COMPRESSION,
                &["snappy"],
            )])),
            _ => Reaction::Default,
        })
        .await;
        let config = ConnectionConfig {
            compression: Some(Compression::Lz4),
            ..Default::default()
        };

        let (connection, _error_receiver) =
            open_connection(node.address(), &config, None).await.unwrap();
        assert_eq!(connection.compression(), None);

        let startup = node
            .received_frames()
            .into_iter()
            .find(|frame| frame.opcode == RequestOpcode::Startup)
            .unwrap();
        let startup_options =
            assert_matches!(startup.deserialize(), Ok(Request::Startup(s)) => s.options);
        assert!(!startup_options.contains_key(options::COMPRESSION));
        assert!(startup_options.contains_key(options::DRIVER_NAME));
    }

    struct EchoAuthenticator;

    struct EchoSession {
        rounds: usize,
    }

    #[async_trait]
    impl AuthenticatorSession for EchoSession {
        async fn evaluate_challenge(
            &mut self,
            token: Option<&[u8]>,
        ) -> Result<Option<Vec<u8>>, AuthError> {
            self.rounds += 1;
            let mut answer = b"re:".to_vec();
            answer.extend_from_slice(token.unwrap_or_default());
            Ok(Some(answer))
        }

        async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
            if self.rounds == 1 {
                Ok(())
            } else {
                Err(format!("expected one challenge, got {}", self.rounds))
            }
        }
    }

    #[async_trait]
    impl AuthenticatorProvider for EchoAuthenticator {
        async fn start_authentication_session(
            &self,
            _authenticator_name: &str,
        ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
            Ok((Some(b"hello".to_vec()), Box::new(EchoSession { rounds: 0 })))
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn authentication_challenge_loop() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| match frame.opcode {
            RequestOpcode::Startup => {
                Reaction::Respond(ResponseFrame::forged_authenticate("ChallengingAuthenticator"))
            }
            RequestOpcode::AuthResponse => match frame.deserialize() {
                Ok(Request::AuthResponse(auth)) if auth.response.as_deref() == Some(&b"hello"[..]) => {
                    Reaction::Respond(ResponseFrame::forged_auth_challenge(b"nonce"))
                }
                Ok(Request::AuthResponse(auth))
                    if auth.response.as_deref() == Some(&b"re:nonce"[..]) =>
                {
                    Reaction::Respond(ResponseFrame::forged_auth_success())
                }
                _ => Reaction::Respond(ResponseFrame::forged_error(
                    DbError::AuthenticationError,
                    "bad credentials",
                )),
            },
            _ => Reaction::Default,
        })
        .await;

        let config = ConnectionConfig {
            authenticator: Some(Arc::new(EchoAuthenticator)),
            ..Default::default()
        };
        let (connection, _error_receiver) =
            open_connection(node.address(), &config, None).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);
        assert_eq!(node.received(RequestOpcode::AuthResponse), 2);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn plain_text_credentials_are_sent() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| match frame.opcode {
            RequestOpcode::Startup => Reaction::Respond(ResponseFrame::forged_authenticate(
                "org.apache.cassandra.auth.PasswordAuthenticator",
            )),
            _ => Reaction::Default,
        })
        .await;

        let config = ConnectionConfig {
            authenticator: Some(Arc::new(PlainTextAuthenticator::new("user", "pass"))),
            ..Default::default()
        };
        let (connection, _error_receiver) =
            open_connection(node.address(), &config, None).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);

        let auth = node
            .received_frames()
            .into_iter()
            .find(|frame| frame.opcode == RequestOpcode::AuthResponse)
            .unwrap();
        let token = assert_matches!(auth.deserialize(), Ok(Request::AuthResponse(a)) => a.response);
        assert_eq!(token.as_deref(), Some(&b"\0user\0pass"[..]));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn authentication_without_authenticator_fails() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| match frame.opcode {
            RequestOpcode::Startup => {
                Reaction::Respond(ResponseFrame::forged_authenticate("PasswordAuthenticator"))
            }
            _ => Reaction::Default,
        })
        .await;

        let err = open_connection(node.address(), &ConnectionConfig::default(), None)
            .await
            .err()
            .unwrap();
        let setup_error = assert_matches!(err, ConnectionError::ConnectionSetupRequestError(e) => e);
        assert_eq!(setup_error.request_kind, RequestOpcode::AuthResponse);
        assert_matches!(
            setup_error.error,
            ConnectionSetupRequestErrorKind::MissingAuthentication
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn events_are_forwarded() {
        setup_tracing();
        let node = MockNode::start().await;
        let (event_sender, mut event_receiver) = mpsc::channel(8);
        let config = ConnectionConfig {
            event_sender: Some(event_sender),
            ..Default::default()
        };

        let (_connection, _error_receiver) =
            open_connection(node.address(), &config, None).await.unwrap();
        assert_eq!(node.received(RequestOpcode::Register), 1);

        let peer = "10.0.0.1:9042".parse().unwrap();
        node.push_event(ResponseFrame::forged_status_up_event(peer));
        assert_eq!(
            event_receiver.recv().await,
            Some(Event::StatusChange(StatusChangeEvent::Up(peer)))
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn keyspace_is_set_on_open() {
        setup_tracing();
        let node = MockNode::start().await;
        let keyspace = VerifiedKeyspaceName::new("ks".to_owned(), true).unwrap();

        let (_connection, _error_receiver) =
            open_connection(node.address(), &ConnectionConfig::default(), Some(&keyspace))
                .await
                .unwrap();
        let use_query = node
            .received_frames()
            .into_iter()
            .find_map(|frame| frame.statement_text())
            .unwrap();
        assert_eq!(use_query, "USE \"ks\"");
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn keyspace_mismatch_is_reported() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| {
            if is_query(frame, "USE ks") {
                Reaction::Respond(ResponseFrame::forged_set_keyspace("other"))
            } else {
                Reaction::Default
            }
        })
        .await;
        let (connection, _error_receiver) =
            open_connection(node.address(), &ConnectionConfig::default(), None)
                .await
                .unwrap();

        let keyspace = VerifiedKeyspaceName::new("ks".to_owned(), false).unwrap();
        assert_matches!(
            connection.use_keyspace(&keyspace).await,
            Err(UseKeyspaceError::KeyspaceNameMismatch { .. })
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn schema_version_is_read_from_system_local() {
        setup_tracing();
        let version = Uuid::from_u128(0x0123_4567_89ab_cdef);
        let node = MockNode::with_reactor(move |frame| {
            if is_query(frame, LOCAL_VERSION) {
                Reaction::Respond(ResponseFrame::forged_rows(
                    1,
                    &[vec![Some(version.as_bytes())]],
                    None,
                ))
            } else {
                Reaction::Default
            }
        })
        .await;
        let (connection, _error_receiver) =
            open_connection(node.address(), &ConnectionConfig::default(), None)
                .await
                .unwrap();

        assert_eq!(connection.fetch_schema_version().await.unwrap(), version);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn connection_is_closed_on_no_response_to_keepalives() {
        setup_tracing();
        let options_seen = Arc::new(AtomicUsize::new(0));
        let node = {
            let options_seen = options_seen.clone();
            MockNode::with_reactor(move |frame| match frame.opcode {
                // The handshake OPTIONS is answered, keepalives are not.
                RequestOpcode::Options if options_seen.fetch_add(1, Ordering::SeqCst) > 0 => {
                    Reaction::Drop
                }
                _ => Reaction::Default,
            })
            .await
        };

        let config = ConnectionConfig {
            keepalive_interval: Some(Duration::from_millis(100)),
            keepalive_timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let (connection, error_receiver) =
            open_connection(node.address(), &config, None).await.unwrap();

        let err = error_receiver.await.unwrap();
        let broken = assert_matches!(err, ConnectionError::BrokenConnection(e) => e);
        assert_matches!(broken.kind(), BrokenConnectionErrorKind::KeepaliveTimeout(_));
        assert!(run(&connection, "q", None).await.is_err());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn close_disposes_the_connection() {
        setup_tracing();
        let node = MockNode::start().await;
        let (connection, error_receiver) =
            open_connection(node.address(), &ConnectionConfig::default(), None)
                .await
                .unwrap();

        connection.close();
        assert_eq!(connection.state(), ConnectionState::Disposed);
        let err = error_receiver.await.unwrap();
        let broken = assert_matches!(err, ConnectionError::BrokenConnection(e) => e);
        assert_matches!(broken.kind(), BrokenConnectionErrorKind::Closed);
    }

    #[test]
    fn keyspace_name_validation() {
        assert!(VerifiedKeyspaceName::new("ks_1".to_owned(), false).is_ok());
        assert_eq!(
            VerifiedKeyspaceName::new(String::new(), false),
            Err(BadKeyspaceName::Empty)
        );
        let long = "a".repeat(49);
        assert_eq!(
            VerifiedKeyspaceName::new(long.clone(), false),
            Err(BadKeyspaceName::TooLong(long, 49))
        );
        assert_eq!(
            VerifiedKeyspaceName::new("ks-1".to_owned(), false),
            Err(BadKeyspaceName::IllegalCharacter("ks-1".to_owned(), '-'))
        );
    }
}
