use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;
use tokio::net::{lookup_host, ToSocketAddrs};
use tracing::warn;

/// Port used when a contact point is given without one.
pub const DEFAULT_PORT: u16 = 9042;

/// How far a host is from the client, as judged by the load balancing policy.
/// Decides how many connections the host's pool keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostDistance {
    Local,
    Remote,
    /// No pool is kept and no request is sent to the host.
    Ignored,
}

/// A node of the cluster, as known to the driver.
#[derive(Debug)]
pub struct Host {
    address: SocketAddr,
    datacenter: Option<String>,
    up: AtomicBool,
}

impl Host {
    /// Hosts start as up; the first failed connection attempt marks them down.
    pub fn new(address: SocketAddr, datacenter: Option<String>) -> Self {
        Host {
            address,
            datacenter,
            up: AtomicBool::new(true),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Returns whether the status actually changed.
    pub(crate) fn set_up(&self, up: bool) -> bool {
        self.up.swap(up, Ordering::AcqRel) != up
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// Failed to turn a contact point into an address.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DnsLookupError {
    #[error("Failed to perform DNS lookup within {0}ms")]
    Timeout(u128),
    #[error("Empty address list returned by DNS for {0}")]
    EmptyAddressListForHost(String),
    #[error(transparent)]
    IoError(#[from] std::sync::Arc<std::io::Error>),
}

async fn lookup_host_with_timeout<T: ToSocketAddrs>(
    host: T,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<impl Iterator<Item = SocketAddr>, DnsLookupError> {
    let lookup = lookup_host(host);
    let addrs = match hostname_resolution_timeout {
        Some(timeout) => tokio::time::timeout(timeout, lookup)
            .await
            .map_err(|_| DnsLookupError::Timeout(timeout.as_millis()))?,
        None => lookup.await,
    };
    addrs.map_err(|err| DnsLookupError::IoError(std::sync::Arc::new(err)))
}

/// Resolves `hostname`, given as `host:port` or bare `host`, preferring IPv4.
pub(crate) async fn resolve_hostname(
    hostname: &str,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<SocketAddr, DnsLookupError> {
    // A bare host name fails to parse immediately; retry it with the default port,
    // unless the first lookup timed out.
    let addrs = match lookup_host_with_timeout(hostname, hostname_resolution_timeout).await {
        Ok(addrs) => itertools::Either::Left(addrs),
        Err(DnsLookupError::Timeout(t)) => return Err(DnsLookupError::Timeout(t)),
        Err(e) => {
            let addrs =
                lookup_host_with_timeout((hostname, DEFAULT_PORT), hostname_resolution_timeout)
                    .await
                    .or(Err(e))?;
            itertools::Either::Right(addrs)
        }
    };

    addrs
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_)))
        .ok_or_else(|| DnsLookupError::EmptyAddressListForHost(hostname.to_owned()))
}

/// A node given to the session on startup.
#[derive(Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// `host` or `host:port`, resolved when the session connects.
    Hostname(String),
    Address(SocketAddr),
}

/// A known node and the datacenter it belongs to, if the user knows it.
///
/// Hosts are never discovered, so the datacenter given here is the only one
/// the load balancing policy sees.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ContactPoint {
    pub node: KnownNode,
    pub datacenter: Option<String>,
}

impl From<KnownNode> for ContactPoint {
    fn from(node: KnownNode) -> Self {
        ContactPoint {
            node,
            datacenter: None,
        }
    }
}

/// Resolves every contact point. Unresolvable ones are logged and skipped;
/// the first contact point resolving to an address wins.
pub(crate) async fn resolve_contact_points(
    contact_points: &[ContactPoint],
    hostname_resolution_timeout: Option<Duration>,
) -> (Vec<Host>, Vec<String>) {
    let resolve_futures = contact_points.iter().map(|contact_point| async move {
        match &contact_point.node {
            KnownNode::Address(address) => Ok(*address),
            KnownNode::Hostname(hostname) => {
                resolve_hostname(hostname, hostname_resolution_timeout)
                    .await
                    .map_err(|e| {
                        warn!("Hostname resolution failed for {}: {}", hostname, &e);
                        hostname.clone()
                    })
            }
        }
    });
    let (resolved, failed): (Vec<_>, Vec<_>) = futures::future::join_all(resolve_futures)
        .await
        .into_iter()
        .zip(contact_points)
        .partition_map(|(result, contact_point)| match result {
            Ok(address) => itertools::Either::Left(Host::new(
                address,
                contact_point.datacenter.clone(),
            )),
            Err(hostname) => itertools::Either::Right(hostname),
        });

    let hosts = resolved
        .into_iter()
        .unique_by(|host| host.address())
        .collect();
    (hosts, failed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::{
        resolve_contact_points, resolve_hostname, ContactPoint, Host, KnownNode, DEFAULT_PORT,
    };

    #[test]
    fn status_change_is_reported_once() {
        let host = Host::new("127.0.0.1:9042".parse().unwrap(), Some("dc1".to_owned()));
        assert!(host.is_up());
        assert!(!host.set_up(true));
        assert!(host.set_up(false));
        assert!(!host.set_up(false));
        assert!(!host.is_up());
        assert_eq!(host.datacenter(), Some("dc1"));
    }

    #[test]
    fn hosts_are_identified_by_address() {
        let a = Arc::new(Host::new("127.0.0.1:9042".parse().unwrap(), None));
        let b = Arc::new(Host::new("127.0.0.1:9042".parse().unwrap(), Some("dc".into())));
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn default_port_is_applied() {
        let addr = resolve_hostname("127.0.0.1", None).await.unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);

        let addr = resolve_hostname("127.0.0.1:19042", None).await.unwrap();
        assert_eq!(addr.port(), 19042);
    }

    #[tokio::test]
    async fn duplicate_contact_points_are_merged() {
        let contact_points = [
            ContactPoint {
                node: KnownNode::Hostname("127.0.0.1".to_owned()),
                datacenter: Some("dc1".to_owned()),
            },
            KnownNode::Address("127.0.0.1:9042".parse().unwrap()).into(),
            KnownNode::Address("127.0.0.2:9042".parse().unwrap()).into(),
        ];
        let (hosts, failed) = resolve_contact_points(&contact_points, None).await;

        assert!(failed.is_empty());
        let resolved: Vec<_> = hosts
            .iter()
            .map(|host| (host.address(), host.datacenter()))
            .collect();
        assert_eq!(
            resolved,
            vec![
                ("127.0.0.1:9042".parse().unwrap(), Some("dc1")),
                ("127.0.0.2:9042".parse().unwrap(), None),
            ]
        );
    }
}
