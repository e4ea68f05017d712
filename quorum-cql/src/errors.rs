//! Errors reported by the server in ERROR responses.

use crate::frame::types::Consistency;
use bytes::Bytes;
use thiserror::Error;

/// An error sent from the database in response to a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    #[error("The submitted query has a syntax error")]
    SyntaxError,

    #[error("The query is syntactically correct but invalid")]
    Invalid,

    /// `table` is empty when a keyspace was being created.
    #[error("Keyspace or table already exists (keyspace: {keyspace}, table: {table})")]
    AlreadyExists { keyspace: String, table: String },

    #[error(
        "User defined function failed during execution \
        (keyspace: {keyspace}, function: {function}, arg_types: {arg_types:?})"
    )]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    #[error("Authentication failed - bad credentials")]
    AuthenticationError,

    #[error("The logged user doesn't have the right to perform the query")]
    Unauthorized,

    #[error("The query is invalid because of some configuration issue")]
    ConfigError,

    /// Not enough replicas are alive to reach the requested consistency.
    #[error(
        "Not enough nodes are alive to satisfy required consistency level \
        (consistency: {consistency}, required: {required}, alive: {alive})"
    )]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    #[error("The coordinator node is overloaded")]
    Overloaded,

    #[error("The coordinator node is still bootstrapping")]
    IsBootstrapping,

    #[error("Error during truncate operation")]
    TruncateError,

    /// Too few replicas answered a read in time. `data_present` tells
    /// whether the replica asked for the actual data was among them.
    #[error(
        "Not enough nodes responded to the read request in time \
        (consistency: {consistency}, received: {received}, required: {required}, data_present: {data_present})"
    )]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },

    #[error(
        "Not enough nodes responded to the write request in time \
        (consistency: {consistency}, received: {received}, required: {required}, write_type: {write_type})"
    )]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    #[error(
        "A non-timeout error during a read request \
        (consistency: {consistency}, received: {received}, required: {required}, \
        numfailures: {numfailures}, data_present: {data_present})"
    )]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        data_present: bool,
    },

    #[error(
        "A non-timeout error during a write request \
        (consistency: {consistency}, received: {received}, required: {required}, \
        numfailures: {numfailures}, write_type: {write_type})"
    )]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    /// The contacted node does not know the prepared statement id.
    #[error("Tried to execute a prepared statement that is not prepared on this node")]
    Unprepared { statement_id: Bytes },

    #[error("Internal server error")]
    ServerError,

    #[error("Invalid protocol message received from the driver")]
    ProtocolError,

    #[error("Error code {0:#06x} is not known to the driver")]
    Other(i32),
}

impl DbError {
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::FunctionFailure { .. } => 0x1400,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}

/// Type of write operation requested, as reported in write timeouts and failures.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    /// Non-batched non-counter write
    Simple,
    /// Logged batch whose batch log write succeeded.
    Batch,
    UnloggedBatch,
    Counter,
    /// The write to the batch log itself timed out.
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl From<&str> for WriteType {
    fn from(write_type_str: &str) -> WriteType {
        match write_type_str {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            _ => WriteType::Other(write_type_str.to_string()),
        }
    }
}

impl WriteType {
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
