use super::{RetryContext, RetryDecision, RetryPolicy};
use crate::errors::WriteType;

/// Forwards all errors directly to the user, never retries
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_read_timeout(&self, _: &RetryContext, _: i32, _: i32, _: bool) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_write_timeout(&self, _: &RetryContext, _: &WriteType, _: i32, _: i32) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_unavailable(&self, _: &RetryContext, _: i32, _: i32) -> RetryDecision {
        RetryDecision::Rethrow
    }
}
