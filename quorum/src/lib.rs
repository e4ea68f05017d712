//! Async driver core for databases speaking the CQL native protocol (v3/v4).
//!
//! The driver keeps an elastic pool of multiplexed connections to every
//! known node and runs each request through a retry-aware state machine:
//! the load balancing policy orders the hosts, failed attempts are classified
//! and moved to the same or the next host, unknown prepared statements are
//! prepared again transparently.
//!
//! Values bound to statements and cells of returned rows are opaque byte
//! strings; encoding CQL types is left to a separate codec.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Session]\
//! `Session` is created by specifying a few known nodes and connecting to them:
//!
//! ```rust,no_run
//! use quorum::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!    let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .known_node("1.2.3.4:9876")
//!         .build()
//!         .await?;
//!
//!    Ok(())
//! }
//! ```
//! The driver never discovers nodes on its own: the known nodes are all the
//! hosts a session will use.
//!
//! ### Making queries
//! * [Simple](crate::Session::query_unpaged)
//! * [Simple paged](crate::Session::query_iter)
//! * [Prepared](crate::Session::execute_unpaged) (need to be [prepared](crate::Session::prepare) before use)
//! * [Prepared paged](crate::Session::execute_iter)
//! * [Batch](crate::Session::batch)
//!
//! To specify options for a single statement create the statement object and configure it:
//! * For simple: [Statement](crate::statement::Statement)
//! * For prepared: [PreparedStatement](crate::statement::PreparedStatement)
//! * For batch: [Batch](crate::statement::Batch)
//!
//! ```rust
//! # use quorum::Session;
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! use quorum::values::SerializedValues;
//!
//! let mut values = SerializedValues::new();
//! values.add_value(2_i32.to_be_bytes().to_vec());
//! session
//!     .query_unpaged("INSERT INTO ks.tab (a) VALUES(?)", &values)
//!     .await?;
//!
//! let result = session
//!     .query_unpaged("SELECT a FROM ks.tab", SerializedValues::EMPTY)
//!     .await?;
//! for row in result.rows() {
//!     let cells: Vec<Option<&[u8]>> = row?;
//!     println!("{:?}", cells);
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod observability;
pub mod policies;
pub mod response;
pub mod statement;

pub(crate) mod utils;

/// Bound values of a statement, already serialized by the caller.
pub mod values {
    pub use quorum_cql::values::SerializedValues;
}

pub use quorum_cql::{Consistency, SerialConsistency};

pub use client::pager::QueryPager;
pub use client::session::{Session, SessionConfig};
pub use client::session_builder::SessionBuilder;
pub use observability::metrics::Metrics;
pub use response::QueryResult;
