use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use rand::{rng, Rng};
use tracing::trace;

use super::{LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::{Host, HostDistance};
use crate::Consistency;

/// Rotates over the hosts, one step per request.
///
/// With a local datacenter set, hosts of that datacenter are tried first and
/// hosts elsewhere only if datacenter failover is permitted and the consistency
/// is not a local one. Hosts currently marked down go last: they are still
/// worth a try once everything else failed.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    local_dc: Option<String>,
    permit_dc_failover: bool,
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    /// A policy treating every host as local.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RoundRobinPolicyBuilder {
        RoundRobinPolicyBuilder::new()
    }

    fn is_local(&self, host: &Host) -> bool {
        match (&self.local_dc, host.datacenter()) {
            (Some(local_dc), Some(dc)) => local_dc == dc,
            // Hosts of unknown datacenter are treated as local.
            _ => true,
        }
    }

    fn is_datacenter_failover_possible(&self, request: &RoutingInfo<'_>) -> bool {
        self.permit_dc_failover
            && !matches!(
                request.consistency,
                Consistency::LocalOne | Consistency::LocalQuorum | Consistency::LocalSerial
            )
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan<'a>(&'a self, request: &RoutingInfo<'_>, hosts: &'a [Arc<Host>]) -> Plan<'a> {
        let len = hosts.len();
        if len == 0 {
            return Box::new(std::iter::empty());
        }
        let start = self.index.fetch_add(1, Ordering::Relaxed) % len;
        let rotated = hosts[start..].iter().chain(hosts[..start].iter());

        let failover = self.is_datacenter_failover_possible(request);
        let eligible = move |host: &&'a Arc<Host>| {
            self.is_local(host) || (failover && self.distance(host) != HostDistance::Ignored)
        };

        let (up, down): (Vec<_>, Vec<_>) = rotated
            .filter(eligible)
            .partition(|host| host.is_up());
        let (local_up, remote_up): (Vec<_>, Vec<_>) =
            up.into_iter().partition(|host| self.is_local(host));

        trace!(
            local = local_up.len(),
            remote = remote_up.len(),
            down = down.len(),
            "Computed round robin plan"
        );

        Box::new(
            local_up
                .into_iter()
                .chain(remote_up)
                .chain(down)
                .unique_by(|host| host.address()),
        )
    }

    fn distance(&self, host: &Host) -> HostDistance {
        if self.is_local(host) {
            HostDistance::Local
        } else if self.permit_dc_failover {
            HostDistance::Remote
        } else {
            HostDistance::Ignored
        }
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}

/// The builder of [`RoundRobinPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RoundRobinPolicyBuilder {
    local_dc: Option<String>,
    permit_dc_failover: bool,
}

impl RoundRobinPolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the datacenter to be preferred by this policy.
    pub fn prefer_datacenter(mut self, datacenter_name: String) -> Self {
        self.local_dc = Some(datacenter_name);
        self
    }

    /// Allows hosts outside the preferred datacenter to be contacted, after
    /// the local ones, for non-local consistencies.
    pub fn permit_dc_failover(mut self, permit: bool) -> Self {
        self.permit_dc_failover = permit;
        self
    }

    pub fn build(self) -> RoundRobinPolicy {
        RoundRobinPolicy {
            local_dc: self.local_dc,
            permit_dc_failover: self.permit_dc_failover,
            // Clients started together should not all hit the same host first.
            index: AtomicUsize::new(rng().random_range(0..usize::MAX / 2)),
        }
    }
}
