//! Defines the [`Batch`] type, a group of statements applied together.

use super::{impl_statement_config_accessors, StatementConfig};
use crate::statement::{PreparedStatement, Statement};

pub use quorum_cql::frame::request::batch::BatchType;

/// One statement inside a batch.
#[derive(Debug, Clone)]
pub enum BatchStatement {
    Query(Statement),
    PreparedStatement(PreparedStatement),
}

impl From<&str> for BatchStatement {
    fn from(s: &str) -> Self {
        BatchStatement::Query(Statement::from(s))
    }
}

impl From<Statement> for BatchStatement {
    fn from(s: Statement) -> Self {
        BatchStatement::Query(s)
    }
}

impl From<PreparedStatement> for BatchStatement {
    fn from(p: PreparedStatement) -> Self {
        BatchStatement::PreparedStatement(p)
    }
}

/// A batch of statements, executed as one request.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub(crate) config: StatementConfig,

    pub statements: Vec<BatchStatement>,
    batch_type: BatchType,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            ..Default::default()
        }
    }

    pub fn new_with_statements(batch_type: BatchType, statements: Vec<BatchStatement>) -> Self {
        Self {
            batch_type,
            statements,
            ..Default::default()
        }
    }

    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }

    pub fn get_type(&self) -> BatchType {
        self.batch_type
    }

    /// Prepared statements of the batch with the given id.
    /// The prepared statement of this batch with the given id, if any.
    pub(crate) fn prepared_with_id(&self, id: &[u8]) -> Option<&PreparedStatement> {
        self.statements.iter().find_map(|statement| match statement {
            BatchStatement::PreparedStatement(prepared) if prepared.get_id().as_ref() == id => {
                Some(prepared)
            }
            _ => None,
        })
    }
}

impl_statement_config_accessors!(Batch);
