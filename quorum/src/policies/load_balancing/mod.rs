//! Load balancing configurations\
//! `Session` can use any load balancing policy which implements the `LoadBalancingPolicy` trait.
//! The policy orders hosts for each request and classifies them by distance,
//! which decides how large their connection pools are.

use std::sync::Arc;

use crate::cluster::{Host, HostDistance};
use crate::{Consistency, SerialConsistency};

mod round_robin;
pub use round_robin::{RoundRobinPolicy, RoundRobinPolicyBuilder};

/// Represents info about statement that can be used by load balancing policies.
#[derive(Default, Clone, Debug)]
pub struct RoutingInfo<'a> {
    /// Keyspace the statement runs in, if known.
    pub keyspace: Option<&'a str>,
    /// Requested consistency information allows to route requests to the appropriate
    /// datacenters. E.g. requests with a LOCAL_ONE consistency should be routed to the same
    /// datacenter.
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub is_idempotent: bool,
}

/// Hosts to try for one request, best first.
///
/// The plan is consumed lazily: most requests succeed on the first host.
pub type Plan<'a> = Box<dyn Iterator<Item = &'a Arc<Host>> + Send + Sync + 'a>;

/// Policy that decides which hosts to contact for each request.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the hosts to contact for a given request, in order.
    /// A host should appear at most once.
    fn plan<'a>(&'a self, request: &RoutingInfo<'_>, hosts: &'a [Arc<Host>]) -> Plan<'a>;

    /// Classifies a host. Ignored hosts get no connection pool.
    fn distance(&self, host: &Host) -> HostDistance;

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}
