//! Hosts of the cluster as seen by the driver: address, datacenter, up/down
//! status and the distance assigned by the load balancing policy.

pub(crate) mod node;

pub use node::{ContactPoint, DnsLookupError, Host, HostDistance, KnownNode, DEFAULT_PORT};
