use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use histogram::{AtomicHistogram, Histogram};
use thiserror::Error;

const ORDERING: Ordering = Ordering::Relaxed;

/// Error that occurred upon a metrics operation.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Histogram error: {0}")]
    HistogramError(#[from] Arc<dyn std::error::Error + Send + Sync>),
    #[error("Histogram is empty")]
    Empty,
}

/// Driver-side counters and request latency histogram.
///
/// One instance is owned by a session and shared with its pools; read it
/// through `Session::get_metrics`.
pub struct Metrics {
    failed_requests: AtomicU64,
    requests: AtomicU64,
    failed_pages: AtomicU64,
    pages: AtomicU64,
    retries: AtomicU64,
    reprepares: AtomicU64,
    total_connections: AtomicU64,
    connection_errors: AtomicU64,
    histogram: Arc<AtomicHistogram>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    /// Increments counter for errors that occurred in nonpaged queries.
    pub(crate) fn inc_failed_nonpaged_queries(&self) {
        self.failed_requests.fetch_add(1, ORDERING);
    }

    /// Increments counter for nonpaged queries.
    pub(crate) fn inc_total_nonpaged_queries(&self) {
        self.requests.fetch_add(1, ORDERING);
    }

    /// Increments counter for errors that occurred in paged queries.
    pub(crate) fn inc_failed_paged_queries(&self) {
        self.failed_pages.fetch_add(1, ORDERING);
    }

    /// Increments counter for pages fetched by paged queries.
    /// A pager that yields 4 pages increments it 4 times.
    pub(crate) fn inc_total_paged_queries(&self) {
        self.pages.fetch_add(1, ORDERING);
    }

    /// Counts attempts made after the first one of the same request.
    pub(crate) fn inc_retries_num(&self) {
        self.retries.fetch_add(1, ORDERING);
    }

    pub(crate) fn inc_reprepares_num(&self) {
        self.reprepares.fetch_add(1, ORDERING);
    }

    pub(crate) fn inc_total_connections(&self) {
        self.total_connections.fetch_add(1, ORDERING);
    }

    pub(crate) fn dec_total_connections(&self) {
        self.total_connections.fetch_sub(1, ORDERING);
    }

    /// Counts failed attempts to open a connection.
    pub(crate) fn inc_connection_errors(&self) {
        self.connection_errors.fetch_add(1, ORDERING);
    }

    /// Saves latency of a completed request (one page, for paged requests).
    ///
    /// # Arguments
    ///
    /// * `latency` - time in milliseconds that should be logged
    pub(crate) fn log_query_latency(&self, latency: u64) -> Result<(), MetricsError> {
        self.histogram
            .increment(latency)
            .map_err(|err| MetricsError::HistogramError(Arc::new(err)))
    }

    /// Returns average latency in milliseconds
    pub fn get_latency_avg_ms(&self) -> Result<u64, MetricsError> {
        Self::mean(&self.histogram.load())
    }

    /// Returns latency from histogram for a given percentile
    /// # Arguments
    ///
    /// * `percentile` - float value (0.0 - 100.0)
    pub fn get_latency_percentile_ms(&self, percentile: f64) -> Result<u64, MetricsError> {
        match self.histogram.load().percentile(percentile) {
            Err(err) => Err(MetricsError::HistogramError(Arc::new(err))),
            Ok(None) => Err(MetricsError::Empty),
            Ok(Some(bucket)) => Ok(bucket.end()),
        }
    }

    /// Returns counter for errors occurred in nonpaged queries
    pub fn get_errors_num(&self) -> u64 {
        self.failed_requests.load(ORDERING)
    }

    /// Returns counter for nonpaged queries
    pub fn get_queries_num(&self) -> u64 {
        self.requests.load(ORDERING)
    }

    /// Returns counter for errors occurred in paged queries
    pub fn get_errors_iter_num(&self) -> u64 {
        self.failed_pages.load(ORDERING)
    }

    /// Returns counter for pages requested in paged queries
    pub fn get_queries_iter_num(&self) -> u64 {
        self.pages.load(ORDERING)
    }

    /// Returns counter measuring how many times a request was retried
    pub fn get_retries_num(&self) -> u64 {
        self.retries.load(ORDERING)
    }

    /// Returns how many times a statement was prepared again after a node forgot it
    pub fn get_reprepares_num(&self) -> u64 {
        self.reprepares.load(ORDERING)
    }

    /// Returns the number of connections currently open
    pub fn get_total_connections(&self) -> u64 {
        self.total_connections.load(ORDERING)
    }

    /// Returns how many connection attempts failed
    pub fn get_connection_errors_num(&self) -> u64 {
        self.connection_errors.load(ORDERING)
    }

    // The histogram does not provide a mean; every bucket is counted as its midpoint.
    fn mean(h: &Histogram) -> Result<u64, MetricsError> {
        let mut weighted_sum = 0_u128;
        let mut count = 0_u128;

        for bucket in h {
            let mid = ((bucket.start() + bucket.end()) / 2) as u128;
            weighted_sum += mid * bucket.count() as u128;
            count += bucket.count() as u128;
        }

        if count != 0 {
            Ok((weighted_sum / count) as u64)
        } else {
            Err(MetricsError::Empty)
        }
    }
}

// Configuration:
//  - exponent of max value: n = 16
//  - inverse exponent of relative error: p = 12,
//  - max value: N = 65535,
//  - total number of buckets: (n - p + 1) * 2^p = 20480.
const MAX_VALUE_POWER: u8 = 16;
const GROUPING_POWER: u8 = 12;

impl Default for Metrics {
    fn default() -> Self {
        // Both powers are constants within the valid range.
        let histogram = AtomicHistogram::new(GROUPING_POWER, MAX_VALUE_POWER).unwrap();

        Self {
            failed_requests: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            failed_pages: AtomicU64::new(0),
            pages: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            reprepares: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            histogram: Arc::new(histogram),
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("failed_requests", &self.failed_requests)
            .field("requests", &self.requests)
            .field("failed_pages", &self.failed_pages)
            .field("pages", &self.pages)
            .field("retries", &self.retries)
            .field("reprepares", &self.reprepares)
            .field("total_connections", &self.total_connections)
            .field("connection_errors", &self.connection_errors)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{Metrics, MetricsError};

    #[test]
    fn counters_and_latency() {
        let metrics = Metrics::new();
        assert_matches!(metrics.get_latency_avg_ms(), Err(MetricsError::Empty));

        metrics.inc_total_nonpaged_queries();
        metrics.inc_total_nonpaged_queries();
        metrics.inc_failed_nonpaged_queries();
        metrics.inc_retries_num();
        metrics.inc_total_connections();
        metrics.inc_total_connections();
        metrics.dec_total_connections();

        assert_eq!(metrics.get_queries_num(), 2);
        assert_eq!(metrics.get_errors_num(), 1);
        assert_eq!(metrics.get_retries_num(), 1);
        assert_eq!(metrics.get_total_connections(), 1);

        for latency in [10, 20, 30] {
            metrics.log_query_latency(latency).unwrap();
        }
        assert_eq!(metrics.get_latency_avg_ms().unwrap(), 20);
        let p99 = metrics.get_latency_percentile_ms(99.0).unwrap();
        assert!((30..=31).contains(&p99));
    }

    #[test]
    fn latency_above_histogram_range_is_rejected() {
        let metrics = Metrics::new();
        assert_matches!(
            metrics.log_query_latency(1 << 20),
            Err(MetricsError::HistogramError(_))
        );
    }
}
