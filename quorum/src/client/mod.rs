pub(crate) mod execution;

pub mod pager;

pub mod session;

pub mod session_builder;


pub use quorum_cql::frame::Compression;
