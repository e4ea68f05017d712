use super::{RetryContext, RetryDecision, RetryPolicy};
use crate::errors::WriteType;

/// Default retry policy - retries when there is a high chance that a retry might help.\
/// Every kind of consistency error is retried at most once per request.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    // ReadTimeout - coordinator didn't receive enough replies in time.
    // Retry only if there were actually enough replies to satisfy consistency
    // but they were all just checksums (data_present == false). This happens
    // when the coordinator picked replicas that were overloaded or dying; the
    // retried request is answered by the replicas that still respond.
    fn on_read_timeout(
        &self,
        ctx: &RetryContext,
        received: i32,
        required: i32,
        data_present: bool,
    ) -> RetryDecision {
        if ctx.consistency.is_serial() || ctx.retry_count > 0 {
            return RetryDecision::Rethrow;
        }
        if received >= required && !data_present {
            RetryDecision::Retry(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    // Write timeout - only the batch log write is retried. The coordinator
    // probably didn't detect the nodes as dead yet; by the time we retry it should.
    fn on_write_timeout(
        &self,
        ctx: &RetryContext,
        write_type: &WriteType,
        _received: i32,
        _required: i32,
    ) -> RetryDecision {
        if ctx.consistency.is_serial() || ctx.retry_count > 0 || !ctx.is_idempotent {
            return RetryDecision::Rethrow;
        }
        match write_type {
            WriteType::BatchLog => RetryDecision::Retry(None),
            _ => RetryDecision::Rethrow,
        }
    }

    // Unavailable - the coordinator believes that not enough nodes are alive.
    // Maybe it has network problems: try a different one, once. It's unlikely
    // that two nodes have network problems at the same time.
    fn on_unavailable(&self, ctx: &RetryContext, _required: i32, _alive: i32) -> RetryDecision {
        if ctx.retry_count > 0 {
            RetryDecision::Rethrow
        } else {
            RetryDecision::Retry(None)
        }
    }
}
