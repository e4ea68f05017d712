//! Statements that can be executed by a [`Session`](crate::client::session::Session):
//! unprepared [`Statement`]s, [`PreparedStatement`]s and [`Batch`]es.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::BadQuery;
use crate::policies::retry::{ClientTimeoutRetry, RetryPolicy};

pub mod batch;
pub mod prepared;
pub mod unprepared;

pub use crate::{Consistency, SerialConsistency};
pub use batch::{Batch, BatchStatement, BatchType};
pub use prepared::PreparedStatement;
pub use unprepared::Statement;

/// Page size used when a statement does not set one.
pub const DEFAULT_PAGE_SIZE: i32 = 5000;

/// Per-statement overrides of the session defaults.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<Option<SerialConsistency>>,

    pub(crate) is_idempotent: bool,

    pub(crate) tracing: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) request_timeout: Option<Duration>,

    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) client_timeout_retry: Option<ClientTimeoutRetry>,
}

impl StatementConfig {
    #[must_use]
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }

    #[must_use]
    pub(crate) fn determine_serial_consistency(
        &self,
        default_serial_consistency: Option<SerialConsistency>,
    ) -> Option<SerialConsistency> {
        self.serial_consistency
            .unwrap_or(default_serial_consistency)
    }
}

/// Shared by statement kinds: consistency, idempotence, timeouts and policy overrides.
macro_rules! impl_statement_config_accessors {
    ($type:ty) => {
        impl $type {
            /// Sets the consistency to be used when executing this statement.
            pub fn set_consistency(&mut self, c: $crate::Consistency) {
                self.config.consistency = Some(c);
            }

            /// Gets the consistency overridden on this statement, if any.
            pub fn get_consistency(&self) -> Option<$crate::Consistency> {
                self.config.consistency
            }

            /// Sets the serial consistency to be used when executing this statement.
            /// (Ignored unless the statement is a lightweight transaction)
            pub fn set_serial_consistency(&mut self, sc: Option<$crate::SerialConsistency>) {
                self.config.serial_consistency = Some(sc);
            }

            pub fn get_serial_consistency(&self) -> Option<$crate::SerialConsistency> {
                self.config.serial_consistency.flatten()
            }

            /// A statement is idempotent if applying it several times has
            /// the same effect as applying it once. Only idempotent statements
            /// are retried after a client-side timeout.
            pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
                self.config.is_idempotent = is_idempotent;
            }

            pub fn get_is_idempotent(&self) -> bool {
                self.config.is_idempotent
            }

            /// Asks the node to trace this statement.
            pub fn set_tracing(&mut self, should_trace: bool) {
                self.config.tracing = should_trace;
            }

            pub fn get_tracing(&self) -> bool {
                self.config.tracing
            }

            /// Sets the default timestamp for this statement in microseconds.
            pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
                self.config.timestamp = timestamp
            }

            pub fn get_timestamp(&self) -> Option<i64> {
                self.config.timestamp
            }

            /// Sets the client-side timeout for this statement.
            /// A timeout breaks the connection the request was sent on.
            pub fn set_request_timeout(&mut self, timeout: Option<std::time::Duration>) {
                self.config.request_timeout = timeout
            }

            pub fn get_request_timeout(&self) -> Option<std::time::Duration> {
                self.config.request_timeout
            }

            /// Overrides the session's retry policy for this statement.
            pub fn set_retry_policy(
                &mut self,
                retry_policy: Option<std::sync::Arc<dyn $crate::policies::retry::RetryPolicy>>,
            ) {
                self.config.retry_policy = retry_policy;
            }

            pub fn get_retry_policy(
                &self,
            ) -> Option<&std::sync::Arc<dyn $crate::policies::retry::RetryPolicy>> {
                self.config.retry_policy.as_ref()
            }

            /// Overrides where this statement is retried after a client-side timeout.
            pub fn set_client_timeout_retry(
                &mut self,
                retry: Option<$crate::policies::retry::ClientTimeoutRetry>,
            ) {
                self.config.client_timeout_retry = retry;
            }

            pub fn get_client_timeout_retry(
                &self,
            ) -> Option<$crate::policies::retry::ClientTimeoutRetry> {
                self.config.client_timeout_retry
            }
        }
    };
}

pub(crate) use impl_statement_config_accessors;

pub(crate) fn validate_page_size(page_size: i32) -> Result<i32, BadQuery> {
    if page_size > 0 {
        Ok(page_size)
    } else {
        Err(BadQuery::NonPositivePageSize(page_size))
    }
}
