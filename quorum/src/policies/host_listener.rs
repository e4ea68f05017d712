//! Host listeners can subscribe to host up/down events.
//!
//! A host is reported down when its connection pool fails to open a
//! connection, or loses its last healthy one to a fault. It is reported up
//! again once a connection to it succeeds.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::Host;

/// Context provided to [HostListener] callbacks.
#[non_exhaustive]
#[derive(Debug)]
pub struct HostEventContext {
    pub(crate) addr: SocketAddr,
    pub(crate) datacenter: Option<String>,
}

impl HostEventContext {
    fn for_host(host: &Host) -> Self {
        HostEventContext {
            addr: host.address(),
            datacenter: host.datacenter().map(str::to_owned),
        }
    }

    /// Address of the host related to the event.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }
}

/// Kind of host event being signalled by [HostListener].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// A connection to the host was opened after it had been down.
    Up,

    /// The driver could not open a connection to the host, or its last
    /// healthy connection broke.
    Down,
}

/// Allows listening to host UP and DOWN events.
///
/// Events are deduplicated: after UP, the next event for the same host is DOWN,
/// and vice versa.
pub trait HostListener: Send + Sync {
    /// Called when a host event occurs.
    fn on_event(&self, ctx: &HostEventContext, event: &HostEvent);
}

/// Flips host status and fans changes out to the registered listeners.
#[derive(Default)]
pub(crate) struct HostStatusNotifier {
    listeners: Vec<Arc<dyn HostListener>>,
}

impl HostStatusNotifier {
    pub(crate) fn new(listeners: Vec<Arc<dyn HostListener>>) -> Self {
        HostStatusNotifier { listeners }
    }

    pub(crate) fn mark_up(&self, host: &Host) {
        if host.set_up(true) {
            info!(node_addr = %host.address(), "Host is up");
            self.notify(host, HostEvent::Up);
        }
    }

    pub(crate) fn mark_down(&self, host: &Host) {
        if host.set_up(false) {
            info!(node_addr = %host.address(), "Host is down");
            self.notify(host, HostEvent::Down);
        }
    }

    fn notify(&self, host: &Host, event: HostEvent) {
        if self.listeners.is_empty() {
            return;
        }
        let ctx = HostEventContext::for_host(host);
        for listener in &self.listeners {
            listener.on_event(&ctx, &event);
        }
        debug!(
            node_addr = %host.address(),
            listeners = self.listeners.len(),
            "Host event delivered"
        );
    }
}

impl std::fmt::Debug for HostStatusNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStatusNotifier")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
