//! Frame transport and per-host connection pools.

mod connection;
pub(crate) use connection::{open_connection, ConnectionConfig, VerifiedKeyspaceName};

mod connection_pool;

pub use connection_pool::PoolingOptions;
pub(crate) use connection_pool::{
    use_keyspace_result, NodeConnectionPool, PoolConfig, PooledConnection,
};

pub mod tls;
