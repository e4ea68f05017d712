use tracing::debug;

use super::{RetryContext, RetryDecision, RetryPolicy};
use crate::errors::WriteType;
use crate::Consistency;

/// Downgrading consistency retry policy - retries with lower consistency level if it knows\
/// that the initial CL is unreachable. Also, it behaves as [DefaultRetryPolicy](crate::policies::retry::DefaultRetryPolicy)
/// when it believes that the initial CL is reachable.
///
/// A request is retried at most once, whatever the error.
#[derive(Debug, Default)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    pub fn new() -> DowngradingConsistencyRetryPolicy {
        DowngradingConsistencyRetryPolicy
    }
}

fn max_likely_to_work_cl(known_ok: i32, previous_cl: Consistency) -> RetryDecision {
    let decision = if known_ok >= 3 {
        RetryDecision::Retry(Some(Consistency::Three))
    } else if known_ok == 2 {
        RetryDecision::Retry(Some(Consistency::Two))
    } else if known_ok == 1 || previous_cl == Consistency::EachQuorum {
        // EACH_QUORUM does not report a global number of alive replicas,
        // so even with 0 alive there might be a node up in another datacenter.
        RetryDecision::Retry(Some(Consistency::One))
    } else {
        RetryDecision::Rethrow
    };
    if let RetryDecision::Retry(new_cl) = &decision {
        debug!(
            "Decided to lower required consistency from {} to {:?}.",
            previous_cl, new_cl
        );
    }
    decision
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
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
        if received < required {
            max_likely_to_work_cl(received, ctx.consistency)
        } else if !data_present {
            RetryDecision::Retry(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_write_timeout(
        &self,
        ctx: &RetryContext,
        write_type: &WriteType,
        received: i32,
        _required: i32,
    ) -> RetryDecision {
        if ctx.consistency.is_serial() || ctx.retry_count > 0 || !ctx.is_idempotent {
            return RetryDecision::Rethrow;
        }
        match write_type {
            // At least one replica persisted the write; it will be propagated.
            WriteType::Batch | WriteType::Simple if received > 0 => RetryDecision::Ignore,
            // Only part of the batch could have been persisted,
            // retry with whatever consistency should allow to persist all.
            WriteType::UnloggedBatch => max_likely_to_work_cl(received, ctx.consistency),
            WriteType::BatchLog => RetryDecision::Retry(None),
            WriteType::Counter
            | WriteType::Cas
            | WriteType::View
            | WriteType::Cdc
            | WriteType::Simple
            | WriteType::Batch
            | WriteType::Other(_) => RetryDecision::Rethrow,
            _ => RetryDecision::Rethrow,
        }
    }

    fn on_unavailable(&self, ctx: &RetryContext, _required: i32, alive: i32) -> RetryDecision {
        if ctx.retry_count > 0 {
            return RetryDecision::Rethrow;
        }
        if ctx.consistency.is_serial() {
            // The operation failed at the paxos phase of a LWT. The coordinator
            // may be network-isolated; the next host gets the same consistency.
            return RetryDecision::Retry(None);
        }
        max_likely_to_work_cl(alive, ctx.consistency)
    }
}
