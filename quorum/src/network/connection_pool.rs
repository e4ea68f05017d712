//! Per-host elastic pool of connections.
//!
//! Every connection is one [`PoolEntry`] tagged Active, Draining or Closed.
//! Callers borrow the least busy Active connection; when all of them are above
//! the saturation threshold the pool recycles a Draining connection or opens a
//! new one, up to the per-host maximum. A background maintenance task drains
//! idle excess connections, disposes drained ones once they have nothing in
//! flight, removes broken ones and refills the pool to its core size.

use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use futures::future::RemoteHandle;
use futures::stream::FuturesUnordered;
use futures::{Future, FutureExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn, Instrument};

use super::connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName,
};
use crate::cluster::{Host, HostDistance};
use crate::errors::{
    BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError, UseKeyspaceError,
};
use crate::observability::metrics::Metrics;
use crate::policies::host_listener::HostStatusNotifier;

/// Sizing and occupancy thresholds of the per-host pools.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolingOptions {
    /// Connections kept open to a local host.
    pub core_connections_local: usize,
    /// Upper bound of connections to a local host.
    pub max_connections_local: usize,
    pub core_connections_remote: usize,
    pub max_connections_remote: usize,
    /// An Active connection with fewer requests in flight than this is
    /// drained while the pool is above its core size.
    pub min_simultaneous_requests: usize,
    /// A connection with this many requests in flight is saturated; the pool
    /// grows rather than lend it.
    pub max_simultaneous_requests: usize,
    /// How often the maintenance task sweeps the pool.
    pub maintenance_interval: Duration,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        Self {
            core_connections_local: 2,
            max_connections_local: 8,
            core_connections_remote: 1,
            max_connections_remote: 2,
            min_simultaneous_requests: 25,
            max_simultaneous_requests: 100,
            maintenance_interval: Duration::from_secs(10),
        }
    }
}

impl PoolingOptions {
    pub(crate) fn core_connections(&self, distance: HostDistance) -> usize {
        match distance {
            HostDistance::Local => self.core_connections_local,
            HostDistance::Remote => self.core_connections_remote,
            HostDistance::Ignored => 0,
        }
    }

    pub(crate) fn max_connections(&self, distance: HostDistance) -> usize {
        match distance {
            HostDistance::Local => self.max_connections_local.max(self.core_connections_local),
            HostDistance::Remote => self
                .max_connections_remote
                .max(self.core_connections_remote),
            HostDistance::Ignored => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) pooling: PoolingOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum EntryState {
    Active = 0,
    Draining = 1,
    Closed = 2,
}

impl EntryState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EntryState::Active,
            1 => EntryState::Draining,
            _ => EntryState::Closed,
        }
    }
}

/// One connection of the pool together with its pool state.
pub(crate) struct PoolEntry {
    connection: Connection,
    state: AtomicU8,
    /// Borrows not yet returned. A leased connection is never disposed.
    leases: AtomicUsize,
    /// Borrows that have not dispatched their request yet.
    undispatched: AtomicUsize,
    removed: AtomicBool,
}

impl PoolEntry {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            state: AtomicU8::new(EntryState::Active as u8),
            leases: AtomicUsize::new(0),
            undispatched: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: EntryState, to: EntryState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Closes the entry. Returns true only for the first call.
    fn mark_closed(&self) -> bool {
        self.state.store(EntryState::Closed as u8, Ordering::Release);
        !self.removed.swap(true, Ordering::AcqRel)
    }

    /// Requests in flight plus borrows about to send one.
    fn load(&self) -> usize {
        self.connection.in_flight() + self.undispatched.load(Ordering::Acquire)
    }

    /// Nothing in flight and nobody holding the connection.
    fn is_idle(&self) -> bool {
        self.connection.in_flight() == 0 && self.leases.load(Ordering::Acquire) == 0
    }

    fn is_usable(&self) -> bool {
        self.connection.is_healthy() && self.connection.has_free_streams()
    }
}

/// A borrowed connection. Holding it keeps the connection from being disposed.
///
/// A connection lent by [`NodeConnectionPool::borrow`] counts towards the load
/// of its entry until [`PooledConnection::dispatched`] is called; from then on
/// its request is accounted for by the stream ids in flight.
pub(crate) struct PooledConnection {
    entry: Arc<PoolEntry>,
    undispatched: bool,
}

impl PooledConnection {
    fn lease(entry: Arc<PoolEntry>) -> Self {
        entry.leases.fetch_add(1, Ordering::AcqRel);
        entry.undispatched.fetch_add(1, Ordering::AcqRel);
        Self {
            entry,
            undispatched: true,
        }
    }

    /// A borrow that never adds to the load, for driver-internal requests.
    fn hold(entry: Arc<PoolEntry>) -> Self {
        entry.leases.fetch_add(1, Ordering::AcqRel);
        Self {
            entry,
            undispatched: false,
        }
    }

    /// Marks the request of this borrow as handed to the connection.
    pub(crate) fn dispatched(&mut self) {
        if std::mem::take(&mut self.undispatched) {
            self.entry.undispatched.fetch_sub(1, Ordering::AcqRel);
        }
    }

    #[cfg(test)]
    fn same_as(&self, other: &PooledConnection) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.entry.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.dispatched();
        self.entry.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &Arc::as_ptr(&self.entry))
            .field("state", &self.entry.state())
            .field("undispatched", &self.undispatched)
            .finish()
    }
}

// Backoff of refills that failed to open a connection.
const MIN_FILL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_FILL_BACKOFF: Duration = Duration::from_secs(10);
const FILL_BACKOFF_MULTIPLIER: u32 = 2;

// A simple exponential strategy for pool fill backoffs.
struct RefillDelayStrategy {
    current_delay: Duration,
}

impl RefillDelayStrategy {
    fn new() -> Self {
        Self {
            current_delay: MIN_FILL_BACKOFF,
        }
    }

    fn get_delay(&self) -> Duration {
        self.current_delay
    }

    fn on_successful_fill(&mut self) {
        self.current_delay = MIN_FILL_BACKOFF;
    }

    fn on_fill_error(&mut self) {
        self.current_delay = std::cmp::min(
            MAX_FILL_BACKOFF,
            self.current_delay * FILL_BACKOFF_MULTIPLIER,
        );
    }
}

type OpenedConnection = (Weak<PoolEntry>, ErrorReceiver);

/// Room for one connection counted in `open_count` before it exists.
/// Released on drop unless the connection made it into the pool.
struct SlotReservation {
    shared: Arc<PoolShared>,
    committed: bool,
}

impl SlotReservation {
    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.release_slot();
        }
    }
}

struct BrokenConnectionEvent {
    entry: Weak<PoolEntry>,
    error: ConnectionError,
}

async fn wait_for_error(entry: Weak<PoolEntry>, error_receiver: ErrorReceiver) -> BrokenConnectionEvent {
    BrokenConnectionEvent {
        entry,
        error: error_receiver.await.unwrap_or_else(|_| {
            ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
        }),
    }
}

struct PoolShared {
    host: Arc<Host>,
    distance: HostDistance,
    config: PoolConfig,
    keyspace: ArcSwapOption<VerifiedKeyspaceName>,

    // Replaced as a whole with read-copy-update on every membership change.
    entries: ArcSwap<Vec<Arc<PoolEntry>>>,
    // Entries not yet removed plus connections being opened.
    open_count: AtomicUsize,

    last_error: ArcSwapOption<ConnectionError>,
    initialized: AtomicBool,
    initialized_notify: Notify,
    maintenance_notify: Notify,
    opened_sender: mpsc::UnboundedSender<OpenedConnection>,

    host_status: Arc<HostStatusNotifier>,
    metrics: Arc<Metrics>,
}

impl PoolShared {
    fn core_connections(&self) -> usize {
        self.config.pooling.core_connections(self.distance)
    }

    fn max_connections(&self) -> usize {
        self.config.pooling.max_connections(self.distance)
    }

    /// Reserves room for one more connection. Fails if the pool is at its maximum.
    fn reserve_slot(self: &Arc<Self>) -> Option<SlotReservation> {
        let max = self.max_connections();
        self.open_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .ok()
            .map(|_| SlotReservation {
                shared: self.clone(),
                committed: false,
            })
    }

    fn release_slot(&self) {
        self.open_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Opens a connection into a previously reserved slot.
    ///
    /// The slot is given back if opening fails or the future is dropped
    /// before the new entry joins the pool.
    async fn open_reserved(
        &self,
        mut reservation: SlotReservation,
    ) -> Result<Arc<PoolEntry>, ConnectionError> {
        let keyspace = self.keyspace.load_full();
        let addr = self.host.address();

        let (connection, error_receiver) =
            match open_connection(addr, &self.config.connection_config, keyspace.as_deref()).await
            {
                Ok(opened) => opened,
                Err(err) => {
                    drop(reservation);
                    self.metrics.inc_connection_errors();
                    warn!(node_addr = %addr, error = %err, "Failed to open connection");
                    self.last_error.store(Some(Arc::new(err.clone())));
                    if self.entries.load().iter().all(|e| !e.connection.is_healthy()) {
                        self.host_status.mark_down(&self.host);
                    }
                    return Err(err);
                }
            };

        // The keyspace may have changed while the connection was being opened.
        let current_keyspace = self.keyspace.load_full();
        if current_keyspace.as_deref() != keyspace.as_deref() {
            if let Some(current_keyspace) = current_keyspace {
                if let Err(err) = connection.use_keyspace(&current_keyspace).await {
                    warn!(
                        node_addr = %addr,
                        keyspace = current_keyspace.as_str(),
                        error = %err,
                        "Failed to set keyspace on a new connection"
                    );
                }
            }
        }

        let entry = Arc::new(PoolEntry::new(connection));
        self.entries.rcu(|entries| {
            let mut entries = Vec::clone(entries);
            entries.push(entry.clone());
            entries
        });
        reservation.commit();
        // The receiver lives as long as the maintenance task, which lives as long as the pool.
        let _ = self
            .opened_sender
            .send((Arc::downgrade(&entry), error_receiver));

        self.metrics.inc_total_connections();
        self.last_error.store(None);
        self.host_status.mark_up(&self.host);
        debug!(
            node_addr = %addr,
            connection = ?Arc::as_ptr(&entry),
            open = self.open_count.load(Ordering::Acquire),
            "Opened connection"
        );

        Ok(entry)
    }

    fn remove_entry(&self, entry: &Arc<PoolEntry>) {
        self.entries.rcu(|entries| {
            entries
                .iter()
                .filter(|other| !Arc::ptr_eq(other, entry))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    /// Removes an entry from the pool, at most once.
    fn retire(&self, entry: &Arc<PoolEntry>, reason: &str) {
        if !entry.mark_closed() {
            return;
        }
        entry.connection.close();
        self.remove_entry(entry);
        self.release_slot();
        self.metrics.dec_total_connections();
        debug!(
            node_addr = %self.host.address(),
            connection = ?Arc::as_ptr(entry),
            reason,
            "Connection removed from pool"
        );
    }

    fn handle_broken_connection(&self, event: BrokenConnectionEvent) {
        let Some(entry) = event.entry.upgrade() else {
            return;
        };
        let faulted = match &event.error {
            ConnectionError::BrokenConnection(err) => !matches!(
                err.kind(),
                BrokenConnectionErrorKind::Closed | BrokenConnectionErrorKind::RequestTimeout(_)
            ),
            _ => true,
        };
        if entry.removed.load(Ordering::Acquire) {
            return;
        }
        debug!(
            node_addr = %self.host.address(),
            connection = ?Arc::as_ptr(&entry),
            error = %event.error,
            "Pooled connection broke"
        );
        self.retire(&entry, "broken");

        if faulted
            && !self
                .entries
                .load()
                .iter()
                .any(|e| e.connection.is_healthy())
        {
            self.last_error.store(Some(Arc::new(event.error)));
            self.host_status.mark_down(&self.host);
        }
    }

    /// One maintenance pass: removes unhealthy entries, drains idle excess
    /// Active entries and disposes idle Draining ones.
    fn sweep(&self) {
        let entries = self.entries.load_full();
        let core = self.core_connections();
        let min_simultaneous = self.config.pooling.min_simultaneous_requests;

        let mut active = entries
            .iter()
            .filter(|e| e.state() == EntryState::Active && e.connection.is_healthy())
            .count();

        for entry in entries.iter() {
            if !entry.connection.is_healthy() {
                self.retire(entry, "unhealthy");
                continue;
            }
            match entry.state() {
                EntryState::Active
                    if active > core && entry.load() < min_simultaneous =>
                {
                    if entry.transition(EntryState::Active, EntryState::Draining) {
                        active -= 1;
                        trace!(
                            node_addr = %self.host.address(),
                            connection = ?Arc::as_ptr(entry),
                            in_flight = entry.connection.in_flight(),
                            "Draining idle excess connection"
                        );
                    }
                }
                EntryState::Draining if entry.is_idle() => {
                    // Recycling and disposal race on the same state; only one wins.
                    if entry.transition(EntryState::Draining, EntryState::Closed) {
                        self.retire(entry, "drained");
                    }
                }
                _ => {}
            }
        }
    }

    fn missing_connections(&self) -> usize {
        self.core_connections()
            .saturating_sub(self.open_count.load(Ordering::Acquire))
    }
}

/// The connections of a single host.
pub(crate) struct NodeConnectionPool {
    shared: Arc<PoolShared>,
    _maintenance_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("host", &self.shared.host.address())
            .field("distance", &self.shared.distance)
            .field("connections", &self.shared.entries.load().len())
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        host: Arc<Host>,
        distance: HostDistance,
        config: PoolConfig,
        keyspace: Option<VerifiedKeyspaceName>,
        host_status: Arc<HostStatusNotifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (opened_sender, opened_receiver) = mpsc::unbounded_channel();

        let shared = Arc::new(PoolShared {
            host,
            distance,
            config,
            keyspace: ArcSwapOption::from(keyspace.map(Arc::new)),
            entries: ArcSwap::from_pointee(Vec::new()),
            open_count: AtomicUsize::new(0),
            last_error: ArcSwapOption::empty(),
            initialized: AtomicBool::new(false),
            initialized_notify: Notify::new(),
            maintenance_notify: Notify::new(),
            opened_sender,
            host_status,
            metrics,
        });

        let span = tracing::debug_span!("pool_maintenance", node_addr = %shared.host.address());
        let (fut, maintenance_handle) = Self::maintain(shared.clone(), opened_receiver)
            .instrument(span)
            .remote_handle();
        tokio::spawn(fut);

        Self {
            shared,
            _maintenance_handle: maintenance_handle,
        }
    }

    pub(crate) fn host(&self) -> &Arc<Host> {
        &self.shared.host
    }

    pub(crate) fn distance(&self) -> HostDistance {
        self.shared.distance
    }

    /// Lends a connection for one request attempt.
    pub(crate) async fn borrow(&self) -> Result<PooledConnection, ConnectionPoolError> {
        let shared = &self.shared;
        if shared.distance == HostDistance::Ignored {
            return Err(ConnectionPoolError::HostIgnored);
        }
        let max_simultaneous = shared.config.pooling.max_simultaneous_requests;

        let entries = shared.entries.load_full();
        let least_busy = entries
            .iter()
            .filter(|e| e.state() == EntryState::Active && e.is_usable())
            .min_by_key(|e| e.load());

        if let Some(entry) = least_busy {
            if entry.load() < max_simultaneous {
                trace!(
                    node_addr = %shared.host.address(),
                    connection = ?Arc::as_ptr(entry),
                    load = entry.load(),
                    "Lending least busy connection"
                );
                return Ok(PooledConnection::lease(entry.clone()));
            }
        }

        if entries.iter().any(|e| !e.connection.is_healthy()) {
            shared.maintenance_notify.notify_one();
        }

        // Every Active connection is saturated (or there is none).
        let draining = entries
            .iter()
            .filter(|e| e.state() == EntryState::Draining && e.is_usable())
            .min_by_key(|e| e.load());
        if let Some(entry) = draining {
            if entry.transition(EntryState::Draining, EntryState::Active) {
                debug!(
                    node_addr = %shared.host.address(),
                    connection = ?Arc::as_ptr(entry),
                    "Recycled draining connection"
                );
                return Ok(PooledConnection::lease(entry.clone()));
            }
        }

        if let Some(reservation) = shared.reserve_slot() {
            let entry = shared.open_reserved(reservation).await?;
            return Ok(PooledConnection::lease(entry));
        }

        match least_busy {
            Some(entry) if entry.is_usable() => Ok(PooledConnection::lease(entry.clone())),
            _ => {
                trace!(node_addr = %shared.host.address(), "Pool is saturated");
                Err(ConnectionPoolError::Saturated)
            }
        }
    }

    /// Healthy connections, Active or Draining.
    pub(crate) fn connections(&self) -> Vec<PooledConnection> {
        self.shared
            .entries
            .load()
            .iter()
            .filter(|e| e.state() != EntryState::Closed && e.connection.is_healthy())
            .cloned()
            .map(PooledConnection::hold)
            .collect()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.shared.entries.load().len()
    }

    /// Error of the last failed connection attempt, cleared by a successful one.
    pub(crate) fn last_error(&self) -> Option<ConnectionError> {
        self.shared.last_error.load_full().map(|err| (*err).clone())
    }

    /// Waits until the first fill of the pool completes, successfully or not.
    pub(crate) async fn wait_until_initialized(&self) {
        // Registered before the check so the notification cannot be missed.
        let notified = self.shared.initialized_notify.notified();
        if !self.shared.initialized.load(Ordering::Acquire) {
            notified.await;
        }
    }

    /// Sets the keyspace of every current connection and of all future ones.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        self.shared
            .keyspace
            .store(Some(Arc::new(keyspace_name.clone())));

        let connections = self.connections();
        if connections.is_empty() {
            return Ok(());
        }

        let timeout = self.shared.config.connection_config.connect_timeout;
        let results = tokio::time::timeout(
            timeout,
            futures::future::join_all(
                connections
                    .iter()
                    .map(|connection| connection.use_keyspace(&keyspace_name)),
            ),
        )
        .await
        .map_err(|_| UseKeyspaceError::RequestTimeout(timeout))?;

        use_keyspace_result(results.into_iter())
    }

    async fn maintain(
        shared: Arc<PoolShared>,
        mut opened_receiver: mpsc::UnboundedReceiver<OpenedConnection>,
    ) {
        debug!("Started pool maintenance");

        let period = shared.config.pooling.maintenance_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut connection_errors: FuturesUnordered<
            Pin<Box<dyn Future<Output = BrokenConnectionEvent> + Send>>,
        > = FuturesUnordered::new();
        let mut pending_opens: FuturesUnordered<
            Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send>>,
        > = FuturesUnordered::new();

        let mut refill_delay_strategy = RefillDelayStrategy::new();
        let mut had_error_since_last_refill = false;
        let mut next_refill_time = tokio::time::Instant::now();
        let mut refill_scheduled = true;

        loop {
            let mut sweep = false;
            tokio::select! {
                _ = interval.tick() => sweep = true,

                _ = shared.maintenance_notify.notified() => sweep = true,

                _ = tokio::time::sleep_until(next_refill_time), if refill_scheduled => {
                    refill_scheduled = false;
                    had_error_since_last_refill = false;
                    let missing = shared.missing_connections();
                    if missing > 0 {
                        trace!(missing, "Refilling pool");
                    }
                    for _ in 0..missing {
                        let Some(reservation) = shared.reserve_slot() else {
                            break;
                        };
                        let shared = shared.clone();
                        pending_opens.push(Box::pin(async move {
                            shared.open_reserved(reservation).await.map(|_| ())
                        }));
                    }
                }

                result = pending_opens.select_next_some(), if !pending_opens.is_empty() => {
                    if result.is_err() {
                        had_error_since_last_refill = true;
                    }
                }

                event = connection_errors.select_next_some(), if !connection_errors.is_empty() => {
                    shared.handle_broken_connection(event);
                }

                opened = opened_receiver.recv() => match opened {
                    Some((entry, error_receiver)) => {
                        connection_errors.push(Box::pin(wait_for_error(entry, error_receiver)));
                    }
                    None => return,
                },
            }

            if sweep {
                shared.sweep();
            }

            if !refill_scheduled
                && pending_opens.is_empty()
                && !shared.initialized.swap(true, Ordering::AcqRel)
            {
                debug!(
                    connections = shared.entries.load().len(),
                    "Pool initialized"
                );
                shared.initialized_notify.notify_waiters();
            }

            if !refill_scheduled && pending_opens.is_empty() && shared.missing_connections() > 0 {
                if had_error_since_last_refill {
                    refill_delay_strategy.on_fill_error();
                } else {
                    refill_delay_strategy.on_successful_fill();
                }
                let delay = refill_delay_strategy.get_delay();
                debug!("Scheduling next refill in {} ms", delay.as_millis());
                next_refill_time = tokio::time::Instant::now() + delay;
                refill_scheduled = true;
            }
        }
    }

    #[cfg(test)]
    fn sweep(&self) {
        self.shared.sweep();
    }

    #[cfg(test)]
    fn states(&self) -> Vec<EntryState> {
        self.shared.entries.load().iter().map(|e| e.state()).collect()
    }
}

/// Folds the results of switching keyspace on many connections into one.
/// A `BrokenConnectionError` only matters if every connection failed.
pub(crate) fn use_keyspace_result(
    use_keyspace_results: impl Iterator<Item = Result<(), UseKeyspaceError>>,
) -> Result<(), UseKeyspaceError> {
    use crate::errors::RequestAttemptError;

    let mut was_ok = false;
    let mut broken_conn_error: Option<UseKeyspaceError> = None;

    for result in use_keyspace_results {
        match result {
            Ok(()) => was_ok = true,
            Err(err) => match err {
                UseKeyspaceError::RequestError(RequestAttemptError::BrokenConnectionError(_)) => {
                    broken_conn_error = Some(err)
                }
                _ => return Err(err),
            },
        }
    }

    match (was_ok, broken_conn_error) {
        (false, Some(err)) => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use quorum_cql::frame::request::query::QueryParameters;
    use quorum_cql::frame::request::RequestOpcode;

    use super::{
        use_keyspace_result, EntryState, NodeConnectionPool, PoolConfig, PoolingOptions,
    };
    use crate::cluster::{Host, HostDistance};
    use crate::errors::{
        BrokenConnectionErrorKind, ConnectionPoolError, RequestAttemptError, UseKeyspaceError,
    };
    use crate::network::connection::{ConnectionConfig, VerifiedKeyspaceName};
    use crate::observability::metrics::Metrics;
    use crate::policies::host_listener::HostStatusNotifier;
    use crate::statement::Statement;
    use crate::utils::test_utils::{setup_tracing, unused_address, MockNode, Reaction, RequestFrame};

    fn pooling(core: usize, max: usize) -> PoolingOptions {
        PoolingOptions {
            core_connections_local: core,
            max_connections_local: max,
            min_simultaneous_requests: 5,
            max_simultaneous_requests: 1,
            // Sweeps are run by hand unless a test says otherwise.
            maintenance_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn new_pool(address: std::net::SocketAddr, pooling: PoolingOptions) -> (NodeConnectionPool, Arc<Host>) {
        let host = Arc::new(Host::new(address, None));
        let pool = NodeConnectionPool::new(
            host.clone(),
            HostDistance::Local,
            PoolConfig {
                connection_config: ConnectionConfig::default(),
                pooling,
            },
            None,
            Arc::new(HostStatusNotifier::default()),
            Arc::new(Metrics::new()),
        );
        (pool, host)
    }

    fn slow_node() -> impl Fn(&RequestFrame) -> Reaction + Send + Sync + 'static {
        |frame| {
            if frame.opcode == RequestOpcode::Query
                && frame.statement_text().as_deref() == Some("slow")
            {
                Reaction::delayed(Duration::from_millis(400), Reaction::Default)
            } else {
                Reaction::Default
            }
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn fills_to_core_size() {
        setup_tracing();
        let node = MockNode::start().await;
        let (pool, host) = new_pool(node.address(), pooling(2, 4));

        pool.wait_until_initialized().await;
        assert_eq!(pool.connection_count(), 2);
        assert_eq!(node.accepted_connections(), 2);
        assert!(host.is_up());
        assert!(pool.last_error().is_none());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn grows_when_saturated_and_stops_at_max() {
        setup_tracing();
        let node = MockNode::with_reactor(slow_node()).await;
        let (pool, _host) = new_pool(node.address(), pooling(1, 2));
        pool.wait_until_initialized().await;
        let slow = Statement::new("slow");

        let mut first = pool.borrow().await.unwrap();
        first.dispatched();
        let slow_first = first.query_raw(&slow, QueryParameters::default(), None);

        let (first_result, second) = tokio::join!(slow_first, async {
            eventually(|| first.in_flight() == 1).await;
            let mut second = pool.borrow().await.unwrap();
            assert!(!second.same_as(&first));
            assert_eq!(node.accepted_connections(), 2);

            // Both are saturated and the pool is at its maximum: the least busy one is lent.
            second.dispatched();
            let slow_second = second.query_raw(&slow, QueryParameters::default(), None);
            let (result, third) = tokio::join!(slow_second, async {
                eventually(|| second.in_flight() == 1).await;
                pool.borrow().await.unwrap()
            });
            assert!(result.is_ok());
            assert_eq!(node.accepted_connections(), 2);
            drop(third);
            second
        });
        assert!(first_result.is_ok());
        drop(second);
        assert_eq!(pool.connection_count(), 2);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn dispatched_request_counts_once_towards_load() {
        setup_tracing();
        let node = MockNode::with_reactor(slow_node()).await;
        let options = PoolingOptions {
            max_simultaneous_requests: 2,
            ..pooling(1, 4)
        };
        let (pool, _host) = new_pool(node.address(), options);
        pool.wait_until_initialized().await;
        let slow = Statement::new("slow");

        let mut first = pool.borrow().await.unwrap();
        let entry = first.entry.clone();
        assert_eq!(entry.load(), 1);
        first.dispatched();
        assert_eq!(entry.load(), 0);

        let in_flight = first.query_raw(&slow, QueryParameters::default(), None);
        let (result, ()) = tokio::join!(in_flight, async {
            eventually(|| first.in_flight() == 1).await;
            assert_eq!(entry.load(), 1);

            // One request in flight is below the threshold of two.
            let second = pool.borrow().await.unwrap();
            assert!(second.same_as(&first));
            assert_eq!(entry.load(), 2);
            assert_eq!(node.accepted_connections(), 1);
        });
        assert!(result.is_ok());
        drop(first);
        assert_eq!(entry.load(), 0);
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn cancelled_open_gives_its_slot_back() {
        setup_tracing();
        let options_delayed = AtomicBool::new(false);
        let node = MockNode::with_reactor(move |frame| {
            if frame.opcode == RequestOpcode::Options
                && !options_delayed.swap(true, Ordering::SeqCst)
            {
                Reaction::delayed(Duration::from_secs(1), Reaction::Default)
            } else {
                Reaction::Default
            }
        })
        .await;
        let (pool, _host) = new_pool(node.address(), pooling(0, 1));
        pool.wait_until_initialized().await;
        assert_eq!(pool.connection_count(), 0);

        let cancelled = tokio::time::timeout(Duration::from_millis(100), pool.borrow()).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.shared.open_count.load(Ordering::Acquire), 0);

        let connection = pool.borrow().await.unwrap();
        assert!(connection.is_healthy());
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.shared.open_count.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn draining_keeps_in_flight_requests_and_is_recycled() {
        setup_tracing();
        let node = MockNode::with_reactor(slow_node()).await;
        let (pool, _host) = new_pool(node.address(), pooling(1, 2));
        pool.wait_until_initialized().await;
        let slow_statement = Statement::new("slow");

        let mut first = pool.borrow().await.unwrap();
        first.dispatched();
        let in_flight = first.query_raw(&slow_statement, QueryParameters::default(), None);

        let (result, ()) = tokio::join!(in_flight, async {
            eventually(|| first.in_flight() == 1).await;
            let second = pool.borrow().await.unwrap();
            assert!(!second.same_as(&first));
            drop(second);

            // Two Active connections above a core size of one: the busy
            // one is below the low-water mark too, so it is drained first.
            pool.sweep();
            assert_eq!(pool.states(), vec![EntryState::Draining, EntryState::Active]);
            assert!(first.is_healthy());

            // Saturate the remaining Active connection; the draining one comes back.
            let mut second = pool.borrow().await.unwrap();
            second.dispatched();
            let slow = second.query_raw(&slow_statement, QueryParameters::default(), None);
            let (slow_result, ()) = tokio::join!(slow, async {
                eventually(|| second.in_flight() == 1).await;
                let recycled = pool.borrow().await.unwrap();
                assert!(recycled.same_as(&first));
                assert_eq!(pool.states(), vec![EntryState::Active, EntryState::Active]);
            });
            assert!(slow_result.is_ok());
        });

        // The request survived draining and recycling.
        assert!(result.is_ok());
        assert_eq!(node.accepted_connections(), 2);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn idle_draining_connection_is_disposed() {
        setup_tracing();
        let node = MockNode::start().await;
        let (pool, _host) = new_pool(node.address(), pooling(1, 2));
        pool.wait_until_initialized().await;

        {
            let first = pool.borrow().await.unwrap();
            // A borrow counts as busy until its request is dispatched,
            // so the second borrow opens a new connection.
            let second = pool.borrow().await.unwrap();
            assert!(!second.same_as(&first));
        }
        assert_eq!(pool.connection_count(), 2);

        pool.sweep();
        assert_eq!(pool.states(), vec![EntryState::Draining, EntryState::Active]);
        pool.sweep();
        assert_eq!(pool.states(), vec![EntryState::Active]);
        assert_eq!(pool.shared.open_count.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unhealthy_connection_is_never_recycled() {
        setup_tracing();
        let node = MockNode::with_reactor(slow_node()).await;
        let (pool, _host) = new_pool(node.address(), pooling(1, 2));
        pool.wait_until_initialized().await;

        let first = pool.borrow().await.unwrap();
        let second = pool.borrow().await.unwrap();
        drop(second);
        drop(first);
        pool.sweep();
        assert_eq!(pool.states(), vec![EntryState::Draining, EntryState::Active]);

        let drained = pool.shared.entries.load()[0].clone();
        drained.connection.close();
        assert!(!drained.connection.is_healthy());

        // The Active connection is saturated; the broken draining one must not be lent.
        let slow_statement = Statement::new("slow");
        let mut active = pool.borrow().await.unwrap();
        active.dispatched();
        let slow = active.query_raw(&slow_statement, QueryParameters::default(), None);
        let (result, ()) = tokio::join!(slow, async {
            eventually(|| active.in_flight() == 1).await;
            let lent = pool.borrow().await.unwrap();
            assert!(!Arc::ptr_eq(&lent.entry, &drained));
        });
        assert!(result.is_ok());

        pool.sweep();
        assert!(pool
            .shared
            .entries
            .load()
            .iter()
            .all(|e| !Arc::ptr_eq(e, &drained)));
        assert_eq!(drained.state(), EntryState::Closed);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn broken_connection_is_replaced() {
        setup_tracing();
        let node = MockNode::with_reactor(|frame| {
            if frame.statement_text().as_deref() == Some("boom") {
                Reaction::Close
            } else {
                Reaction::Default
            }
        })
        .await;
        let (pool, host) = new_pool(node.address(), pooling(1, 1));
        pool.wait_until_initialized().await;

        let connection = pool.borrow().await.unwrap();
        let err = connection
            .query_raw(&Statement::new("boom"), QueryParameters::default(), None)
            .await
            .unwrap_err();
        assert_matches!(err, RequestAttemptError::BrokenConnectionError(_));
        drop(connection);

        eventually(|| node.accepted_connections() == 2 && pool.connection_count() == 1).await;
        let replacement = pool.borrow().await.unwrap();
        assert!(replacement.is_healthy());
        assert!(host.is_up());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unreachable_host_is_marked_down() {
        setup_tracing();
        let (pool, host) = new_pool(unused_address().await, pooling(1, 1));
        pool.wait_until_initialized().await;

        assert!(!host.is_up());
        assert!(pool.last_error().is_some());
        assert_matches!(pool.borrow().await, Err(ConnectionPoolError::Connect(_)));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn ignored_host_has_no_connections() {
        setup_tracing();
        let node = MockNode::start().await;
        let pool = NodeConnectionPool::new(
            Arc::new(Host::new(node.address(), None)),
            HostDistance::Ignored,
            PoolConfig {
                connection_config: ConnectionConfig::default(),
                pooling: PoolingOptions::default(),
            },
            None,
            Arc::new(HostStatusNotifier::default()),
            Arc::new(Metrics::new()),
        );
        pool.wait_until_initialized().await;
        assert_matches!(pool.borrow().await, Err(ConnectionPoolError::HostIgnored));
        assert_eq!(node.accepted_connections(), 0);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn keyspace_is_set_on_every_connection() {
        setup_tracing();
        let node = MockNode::start().await;
        let (pool, _host) = new_pool(node.address(), pooling(2, 3));
        pool.wait_until_initialized().await;

        let keyspace = VerifiedKeyspaceName::new("ks".to_owned(), false).unwrap();
        pool.use_keyspace(keyspace).await.unwrap();
        assert_eq!(node.received(RequestOpcode::Query), 2);

        // A connection opened later inherits the keyspace.
        let leases: Vec<_> = vec![pool.borrow().await.unwrap(), pool.borrow().await.unwrap()];
        let third = pool.borrow().await.unwrap();
        assert_eq!(pool.connection_count(), 3);
        assert_eq!(node.received(RequestOpcode::Query), 3);
        drop((leases, third));
    }

    #[test]
    fn keyspace_result_tolerates_some_broken_connections() {
        let broken = || {
            Err(UseKeyspaceError::RequestError(
                RequestAttemptError::BrokenConnectionError(BrokenConnectionErrorKind::Closed.into()),
            ))
        };
        assert!(use_keyspace_result([Ok(()), broken()].into_iter()).is_ok());
        assert_matches!(
            use_keyspace_result([broken(), broken()].into_iter()),
            Err(UseKeyspaceError::RequestError(_))
        );
        assert_matches!(
            use_keyspace_result(
                [
                    Ok(()),
                    Err(UseKeyspaceError::KeyspaceNameMismatch {
                        expected_keyspace_name_lowercase: "a".into(),
                        result_keyspace_name_lowercase: "b".into(),
                    })
                ]
                .into_iter()
            ),
            Err(UseKeyspaceError::KeyspaceNameMismatch { .. })
        );
    }
}
