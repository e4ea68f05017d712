//! Request retries configurations\
//! The orchestrator consults a [RetryPolicy] only for server-side read
//! timeouts, write timeouts and unavailable errors. Connectivity and transient
//! failures always move to the next host and validation errors are never
//! retried, whatever the policy says.

mod default;
mod downgrading_consistency;
mod fallthrough;

pub use default::DefaultRetryPolicy;
pub use downgrading_consistency::DowngradingConsistencyRetryPolicy;
pub use fallthrough::FallthroughRetryPolicy;

use crate::errors::WriteType;
use crate::Consistency;

/// Information about a request that failed with a consistency error.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    /// Consistency with which the request failed.
    pub consistency: Consistency,
    /// A request is idempotent if it can be applied multiple times without changing the result of the initial application\
    /// If set to `true` we can be sure that it is idempotent\
    /// If set to `false` it is unknown whether it is idempotent
    pub is_idempotent: bool,
    /// Retries this policy already asked for during the logical request.
    /// Failovers after connectivity, transient and client timeout errors
    /// are not counted.
    pub retry_count: u32,
}

/// What to do with a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Surface the error to the caller.
    Rethrow,
    /// Pretend the request succeeded with an empty result.
    Ignore,
    /// Try again. `None` keeps the consistency of the failed attempt.
    /// Read and write timeouts are retried on the same host, unavailable
    /// errors on the next one.
    Retry(Option<Consistency>),
}

/// Specifies a policy used to decide when to retry a request.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// The coordinator got `received` of the `required` replica responses in time.
    fn on_read_timeout(
        &self,
        ctx: &RetryContext,
        received: i32,
        required: i32,
        data_present: bool,
    ) -> RetryDecision;

    /// The coordinator got `received` of the `required` write acknowledgements in time.
    fn on_write_timeout(
        &self,
        ctx: &RetryContext,
        write_type: &WriteType,
        received: i32,
        required: i32,
    ) -> RetryDecision;

    /// The coordinator knew only `alive` replicas to be up, `required` were needed.
    fn on_unavailable(&self, ctx: &RetryContext, required: i32, alive: i32) -> RetryDecision;
}

/// Where a request that timed out on the client side goes next.
///
/// Only idempotent requests are retried after a client timeout: the request
/// may still be executing on the node that did not answer in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientTimeoutRetry {
    /// Try the same host again.
    SameHost,
    /// Try the next host of the plan.
    #[default]
    NextHost,
    /// Surface the timeout to the caller.
    Rethrow,
}
