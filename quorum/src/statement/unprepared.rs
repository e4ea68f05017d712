//! Defines the [`Statement`] type, which represents an unprepared statement.

use super::{impl_statement_config_accessors, StatementConfig, DEFAULT_PAGE_SIZE};

/// Unprepared statement, sent as its full text on every execution.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) config: StatementConfig,

    /// The statement text.
    pub contents: String,
    page_size: i32,
}

impl Statement {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            contents: query_text.into(),
            page_size: DEFAULT_PAGE_SIZE,
            config: Default::default(),
        }
    }

    /// Returns self with page size set to the given value.
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.set_page_size(page_size);
        self
    }

    /// Sets the number of rows fetched per page. Must be positive,
    /// which is checked when the statement is executed.
    pub fn set_page_size(&mut self, page_size: i32) {
        self.page_size = page_size;
    }

    pub fn get_page_size(&self) -> i32 {
        self.page_size
    }
}

impl_statement_config_accessors!(Statement);

impl From<String> for Statement {
    fn from(s: String) -> Statement {
        Statement::new(s)
    }
}

impl<'a> From<&'a str> for Statement {
    fn from(s: &'a str) -> Statement {
        Statement::new(s.to_owned())
    }
}
