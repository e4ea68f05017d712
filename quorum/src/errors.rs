//! Errors returned by the driver, grouped by the layer that produces them.
//!
//! * [`ConnectionError`] - a connection could not be opened,
//! * [`BrokenConnectionError`] - an established connection died,
//! * [`RequestAttemptError`] - a single attempt to run a request on one connection failed,
//! * [`ExecutionError`] - what the user sees once the driver gave up on a request.

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub use quorum_cql::errors::{DbError, WriteType};
pub use quorum_cql::frame::frame_errors::{
    CqlRequestSerializationError, CqlResponseParseError, FrameBodyExtensionsParseError,
    FrameHeaderParseError,
};
pub use quorum_cql::frame::request::RequestOpcode;
pub use quorum_cql::frame::response::CqlResponseKind;

use crate::authentication::AuthError;
pub use crate::network::tls::TlsError;

/// Error that the user receives after the driver gave up on executing a request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The statement is malformed and was rejected before being sent.
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// The load balancing policy returned no host to try.
    #[error("Load balancing policy returned an empty plan")]
    EmptyPlan,

    /// Every host in the plan was tried and none of them could serve the request.
    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailable),

    /// The last attempt failed and the driver decided not to retry it.
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    /// The request succeeded, but the cluster did not reach schema agreement afterwards.
    #[error(transparent)]
    SchemaAgreementError(#[from] SchemaAgreementError),

    /// Switching the keyspace failed.
    #[error(transparent)]
    UseKeyspaceError(#[from] UseKeyspaceError),
}

/// Error returned when creating a session failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// No known node was given.
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// None of the given hostnames could be resolved.
    #[error("Failed to resolve any of the known nodes: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// The keyspace to use on every connection is not a valid name.
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// Every host either is ignored or could not be connected to.
    #[error("Could not connect to any known node; errors: {}", display_connect_errors(.0))]
    NoHostConnected(Vec<(SocketAddr, ConnectionError)>),
}

fn display_connect_errors(errors: &[(SocketAddr, ConnectionError)]) -> String {
    errors
        .iter()
        .map(|(addr, err)| format!("{addr}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The host plan was exhausted. Lists every host tried and why it failed.
#[derive(Error, Debug, Clone)]
#[error("No host available; tried: {}", display_host_errors(.errors))]
pub struct NoHostAvailable {
    pub errors: Vec<(SocketAddr, RequestAttemptError)>,
}

fn display_host_errors(errors: &[(SocketAddr, RequestAttemptError)]) -> String {
    let mut out = String::new();
    for (i, (addr, err)) in errors.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        out.push_str(&format!("{addr}: {err}"));
    }
    out
}

/// The statement was rejected locally, before any host was contacted.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    #[error("Page size must be positive, got {0}")]
    NonPositivePageSize(i32),

    #[error("Number of statements in a batch is {0}, the maximum is 65535")]
    TooManyQueriesInBatchStatement(usize),

    #[error("A batch of {statements} statements was given {values} value lists")]
    TooManyBatchValues { statements: usize, values: usize },
}

/// Failed to change the current keyspace.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),

    #[error(
        "Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}"
    )]
    KeyspaceNameMismatch {
        expected_keyspace_name_lowercase: String,
        result_keyspace_name_lowercase: String,
    },

    #[error("Switching keyspace timed out after {0:?}")]
    RequestTimeout(Duration),
}

/// A keyspace name that cannot be sent in a `USE` statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    #[error("Keyspace name is empty")]
    Empty,

    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// Waiting for schema agreement did not succeed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SchemaAgreementError {
    #[error("Schema agreement timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to fetch schema version: {0}")]
    RequestError(#[from] RequestAttemptError),

    #[error("Schema version query returned no usable row")]
    MalformedVersionRow,

    #[error("No connection to any host is available to check schema agreement")]
    NoConnections,

    #[error("Schema agreement task was cancelled")]
    TaskCancelled,
}

/// A connection pool could not provide a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    #[error("Failed to open a connection: {0}")]
    Connect(#[from] ConnectionError),

    #[error("Every connection to the host is saturated")]
    Saturated,

    #[error("The host is ignored by the load balancing policy")]
    HostIgnored,

    #[error("The pool is shutting down")]
    Closed,
}

/// An error that occurred during a single attempt of executing a request
/// on one connection.
///
/// The retry decision is made based on this error.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    #[error("Failed to serialize request: {0}")]
    SerializationError(#[from] CqlRequestSerializationError),

    #[error(transparent)]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),

    #[error(transparent)]
    CqlResponseParseError(#[from] CqlResponseParseError),

    /// The node answered with an ERROR frame.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    #[error("Received unexpected response from the server: {0}. Expected RESULT or ERROR response.")]
    UnexpectedResponse(CqlResponseKind),

    #[error(transparent)]
    BrokenConnectionError(#[from] BrokenConnectionError),

    /// No free stream id on the chosen connection. Not fatal to the connection.
    #[error("All stream ids of the connection are in use")]
    StreamsExhausted,

    /// The request did not receive a response in time.
    /// The connection it was sent on is broken as a consequence.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Re-preparing a statement yielded a different id than it originally had.
    #[error(
        "Prepared statement id changed after repreparation; md5 sum (computed from the query string) should stay the same; \
        Statement: \"{statement}\"; expected id: {expected_id:?}; reprepared id: {reprepared_id:?}"
    )]
    RepreparedIdChanged {
        statement: String,
        expected_id: Bytes,
        reprepared_id: Bytes,
    },

    /// The pool of the host failed to lend a connection.
    #[error("Unable to borrow a connection: {0}")]
    ConnectionPoolError(#[from] ConnectionPoolError),
}

impl From<quorum_cql::frame::response::Error> for RequestAttemptError {
    fn from(value: quorum_cql::frame::response::Error) -> Self {
        RequestAttemptError::DbError(value.error, value.reason)
    }
}

/// Error that occurred while opening a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    #[error("TLS error: {0}")]
    TlsError(#[from] TlsError),

    /// A setup request (OPTIONS, STARTUP, AUTH_RESPONSE, REGISTER or USE) failed.
    #[error(transparent)]
    ConnectionSetupRequestError(#[from] ConnectionSetupRequestError),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    #[error("Node rejected every supported protocol version, last one tried: {0}")]
    ProtocolVersionRejected(u8),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

impl ConnectionError {
    /// Whether the node refused the protocol version proposed in the first request.
    pub(crate) fn is_protocol_version_rejection(&self) -> bool {
        match self {
            ConnectionError::ConnectionSetupRequestError(err) => match &err.error {
                ConnectionSetupRequestErrorKind::DbError(DbError::ProtocolError, reason) => {
                    reason.to_ascii_lowercase().contains("version")
                }
                ConnectionSetupRequestErrorKind::RequestAttempt(attempt) => match attempt.as_ref() {
                    RequestAttemptError::BrokenConnectionError(broken) => {
                        is_version_fault(broken.kind())
                    }
                    _ => false,
                },
                _ => false,
            },
            ConnectionError::BrokenConnection(err) => is_version_fault(err.kind()),
            _ => false,
        }
    }
}

fn is_version_fault(kind: &BrokenConnectionErrorKind) -> bool {
    matches!(
        kind,
        BrokenConnectionErrorKind::VersionMismatch { .. }
            | BrokenConnectionErrorKind::FrameHeaderParseError(
                FrameHeaderParseError::VersionNotSupported(_)
            )
    )
}

/// A request sent while setting a connection up failed.
#[derive(Error, Debug, Clone)]
#[error("Failed to perform a connection setup request. Request: {request_kind}, reason: {error}")]
pub struct ConnectionSetupRequestError {
    pub request_kind: RequestOpcode,
    pub error: ConnectionSetupRequestErrorKind,
}

impl ConnectionSetupRequestError {
    pub(crate) fn new(request_kind: RequestOpcode, error: ConnectionSetupRequestErrorKind) -> Self {
        ConnectionSetupRequestError {
            request_kind,
            error,
        }
    }
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupRequestErrorKind {
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(CqlResponseKind),

    #[error(transparent)]
    RequestAttempt(Box<RequestAttemptError>),

    #[error("Server requested authentication, but no authenticator is configured")]
    MissingAuthentication,

    #[error("Failed to start authentication session: {0}")]
    StartAuthSessionError(AuthError),

    #[error("Failed to evaluate authentication challenge: {0}")]
    AuthChallengeEvaluationError(AuthError),

    #[error("Failed to finish authentication: {0}")]
    AuthFinishError(AuthError),

    #[error("Failed to switch keyspace: {0}")]
    UseKeyspace(Box<UseKeyspaceError>),
}

impl From<RequestAttemptError> for ConnectionSetupRequestErrorKind {
    fn from(value: RequestAttemptError) -> Self {
        match value {
            RequestAttemptError::DbError(err, reason) => {
                ConnectionSetupRequestErrorKind::DbError(err, reason)
            }
            RequestAttemptError::UnexpectedResponse(kind) => {
                ConnectionSetupRequestErrorKind::UnexpectedResponse(kind)
            }
            other => ConnectionSetupRequestErrorKind::RequestAttempt(Box::new(other)),
        }
    }
}

/// A fatal error of an established connection. Every request pending on the
/// connection is completed with a clone of the same value.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    #[error("Failed to read a frame: {0}")]
    FrameHeaderParseError(FrameHeaderParseError),

    #[error("Response frame carries protocol version {received}, connection negotiated {expected}")]
    VersionMismatch { expected: u8, received: u8 },

    #[error("Received response with unexpected stream id {0}")]
    UnexpectedStreamId(i16),

    #[error("Failed to write data: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to handle server event: {0}")]
    CqlEventHandlingError(#[from] CqlEventHandlingError),

    #[error("Timed out while waiting for response to keepalive request on connection to node {0}")]
    KeepaliveTimeout(IpAddr),

    #[error("Failed to execute keepalive request: {0}")]
    KeepaliveRequestError(RequestAttemptError),

    #[error("A request was not answered within {0:?}")]
    RequestTimeout(Duration),

    #[error("Connection was closed")]
    Closed,

    #[error("The connection's worker task stopped unexpectedly")]
    ChannelError,
}

/// Failed to handle an EVENT frame pushed by the server.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CqlEventHandlingError {
    #[error("Failed to deserialize EVENT response: {0}")]
    CqlResponseParseError(#[from] CqlResponseParseError),

    #[error(transparent)]
    BodyExtensionParseError(#[from] FrameBodyExtensionsParseError),

    #[error("Received unexpected server response on stream -1: {0}. Expected EVENT response")]
    UnexpectedResponse(CqlResponseKind),

    #[error("Failed to send event info via channel. The channel is probably closed")]
    SendError,
}

/// Classification of a failed attempt, deciding which host (if any) is tried next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    /// The socket or the pool failed. Host is marked down, next host is tried.
    Connectivity,
    /// The request was not answered in time.
    ClientTimeout,
    /// Overloaded, bootstrapping or truncating node. Next host is tried.
    Transient,
    /// Server read/write timeout or unavailable. Retry policy decides.
    Consistency,
    /// Prepared statement id unknown to the node.
    Unprepared,
    /// Never retried.
    Validation,
}

impl RequestAttemptError {
    pub(crate) fn classify(&self) -> ErrorClass {
        match self {
            RequestAttemptError::RequestTimeout(_) => ErrorClass::ClientTimeout,
            RequestAttemptError::BrokenConnectionError(err) => match err.kind() {
                BrokenConnectionErrorKind::RequestTimeout(_) => ErrorClass::ClientTimeout,
                _ => ErrorClass::Connectivity,
            },
            RequestAttemptError::ConnectionPoolError(ConnectionPoolError::Saturated)
            | RequestAttemptError::StreamsExhausted => ErrorClass::Transient,
            RequestAttemptError::ConnectionPoolError(_) => ErrorClass::Connectivity,
            RequestAttemptError::DbError(db_error, _) => match db_error {
                DbError::Overloaded | DbError::IsBootstrapping | DbError::TruncateError => {
                    ErrorClass::Transient
                }
                DbError::ReadTimeout { .. }
                | DbError::WriteTimeout { .. }
                | DbError::Unavailable { .. } => ErrorClass::Consistency,
                DbError::Unprepared { .. } => ErrorClass::Unprepared,
                _ => ErrorClass::Validation,
            },
            RequestAttemptError::SerializationError(_)
            | RequestAttemptError::BodyExtensionsParseError(_)
            | RequestAttemptError::CqlResponseParseError(_)
            | RequestAttemptError::UnexpectedResponse(_)
            | RequestAttemptError::RepreparedIdChanged { .. } => ErrorClass::Validation,
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Connectivity => "connectivity",
            ErrorClass::ClientTimeout => "client timeout",
            ErrorClass::Transient => "transient",
            ErrorClass::Consistency => "consistency",
            ErrorClass::Unprepared => "unprepared",
            ErrorClass::Validation => "validation",
        };
        f.write_str(name)
    }
}
