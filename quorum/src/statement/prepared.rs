//! Defines the [`PreparedStatement`] type.

use bytes::Bytes;

use super::{impl_statement_config_accessors, StatementConfig, DEFAULT_PAGE_SIZE};
use crate::statement::Statement;

/// A statement prepared on the cluster, executed by its id.
///
/// Nodes may forget prepared ids (after a restart, for instance); the driver
/// then prepares the statement text again on the same connection and replays
/// the execution once, transparently.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) config: StatementConfig,

    id: Bytes,
    statement: String,
    page_size: i32,
}

impl PreparedStatement {
    pub(crate) fn new(id: Bytes, statement: String, page_size: i32, config: StatementConfig) -> Self {
        Self {
            id,
            statement,
            page_size,
            config,
        }
    }

    /// Builds a prepared statement from what the PREPARE request was made of.
    pub(crate) fn from_prepared(id: Bytes, source: &Statement) -> Self {
        Self::new(
            id,
            source.contents.clone(),
            source.get_page_size(),
            source.config.clone(),
        )
    }

    /// The id assigned by the cluster.
    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    /// The statement text, used to re-prepare it.
    pub fn get_statement(&self) -> &str {
        &self.statement
    }

    pub fn set_page_size(&mut self, page_size: i32) {
        self.page_size = page_size;
    }

    pub fn get_page_size(&self) -> i32 {
        self.page_size
    }
}

impl_statement_config_accessors!(PreparedStatement);

impl Default for PreparedStatement {
    fn default() -> Self {
        Self::new(
            Bytes::new(),
            String::new(),
            DEFAULT_PAGE_SIZE,
            StatementConfig::default(),
        )
    }
}
