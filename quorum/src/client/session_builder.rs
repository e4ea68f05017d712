//! Chained construction of a [`Session`] from a [`SessionConfig`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quorum_cql::frame::response::event::Event;
use quorum_cql::frame::Compression;
use tokio::sync::mpsc;

use super::session::{Session, SessionConfig};
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::cluster::{ContactPoint, KnownNode};
use crate::errors::NewSessionError;
use crate::network::tls::TlsContext;
use crate::network::PoolingOptions;
use crate::policies::host_listener::HostListener;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::{ClientTimeoutRetry, RetryPolicy};
use crate::policies::schema_agreement::SchemaAgreementWaiter;
use crate::{Consistency, SerialConsistency};

/// Collects the options of a [`Session`] and connects it with [`SessionBuilder::build`].
/// # Example
///
/// ```
/// # use quorum::client::session::Session;
/// # use quorum::client::session_builder::SessionBuilder;
/// # use quorum::client::Compression;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .compression(Some(Compression::Snappy))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// A builder holding [`SessionConfig::default`]: no known nodes, no
    /// compression, round-robin load balancing and the default retry policy.
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Adds a known node given as `host` or `host:port`, resolved on connect.
    /// # Examples
    /// ```
    /// # use quorum::client::session::Session;
    /// # use quorum::client::session_builder::SessionBuilder;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("db1.example.com")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Adds a known node by socket address.
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// Adds several known nodes given as hostnames.
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.config.add_known_nodes(hostnames);
        self
    }

    /// Add a known node that belongs to the given datacenter.
    ///
    /// Datacenter-aware load balancing policies rely on it to tell local hosts
    /// from remote ones.
    /// # Example
    /// ```
    /// # use quorum::client::session::Session;
    /// # use quorum::client::session_builder::SessionBuilder;
    /// # use quorum::policies::load_balancing::RoundRobinPolicy;
    /// # use std::sync::Arc;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let policy = RoundRobinPolicy::builder()
    ///     .prefer_datacenter("dc1".to_owned())
    ///     .build();
    /// let session: Session = SessionBuilder::new()
    ///     .known_node_in_dc("10.0.0.1:9042", "dc1")
    ///     .known_node_in_dc("10.1.0.1:9042", "dc2")
    ///     .load_balancing(Arc::new(policy))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node_in_dc(mut self, hostname: impl AsRef<str>, datacenter: impl Into<String>) -> Self {
        self.config.known_nodes.push(ContactPoint {
            node: KnownNode::Hostname(hostname.as_ref().to_owned()),
            datacenter: Some(datacenter.into()),
        });
        self
    }

    /// Authenticates with `PasswordAuthenticator` credentials when a node asks for it.
    ///
    /// # Example
    /// ```
    /// # use quorum::client::session::Session;
    /// # use quorum::client::session_builder::SessionBuilder;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .use_keyspace("my_keyspace_name", false)
    ///     .user("cassandra", "cassandra")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn user(mut self, username: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(
            username.into(),
            passwd.into(),
        )));
        self
    }

    /// Authenticates with a custom mechanism. The provider starts one
    /// exchange per connection that has to authenticate.
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// TLS configuration of every connection; `None` connects in plain text.
    pub fn tls_context(mut self, tls_context: Option<impl Into<TlsContext>>) -> Self {
        self.config.tls_context = tls_context.map(Into::into);
        self
    }

    /// Preferred body compression, off by default. Nodes that do not list it
    /// in SUPPORTED get uncompressed connections.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// `TCP_NODELAY` on every socket, on by default.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Enables TCP-level keepalive probes with the given interval. Off by default.
    /// Protocol-level keepalives are set with [`Self::keepalive_interval`].
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Keyspace every connection switches to right after opening.
    /// [`Session::use_keyspace`] changes it later on.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    /// Bound on opening a connection, handshake included. 5 seconds by default.
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Client-side timeout of a single request attempt.
    /// The default is 30 seconds; `None` waits forever.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Bound on resolving a single hostname of a known node.
    pub fn hostname_resolution_timeout(mut self, duration: Option<Duration>) -> Self {
        self.config.hostname_resolution_timeout = duration;
        self
    }

    /// Sets the sizes of the per-host connection pools.
    /// # Example
    /// ```
    /// # use quorum::client::session::Session;
    /// # use quorum::client::session_builder::SessionBuilder;
    /// # use quorum::network::PoolingOptions;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut pooling = PoolingOptions::default();
    /// pooling.core_connections_local = 4;
    /// pooling.max_connections_local = 16;
    ///
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .pooling_options(pooling)
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn pooling_options(mut self, pooling: PoolingOptions) -> Self {
        self.config.pooling = pooling;
        self
    }

    /// Number of stream ids of each connection.
    /// The default is 128.
    pub fn max_stream_ids(mut self, max_stream_ids: usize) -> Self {
        self.config.max_stream_ids = max_stream_ids;
        self
    }

    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing = policy;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Where idempotent statements go after a client-side timeout.
    /// The default is [`ClientTimeoutRetry::NextHost`].
    pub fn client_timeout_retry(mut self, retry: ClientTimeoutRetry) -> Self {
        self.config.client_timeout_retry = retry;
        self
    }

    /// Consistency of statements that do not set their own.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.config.consistency = consistency;
        self
    }

    pub fn serial_consistency(mut self, serial_consistency: Option<SerialConsistency>) -> Self {
        self.config.serial_consistency = serial_consistency;
        self
    }

    /// How often idle connections are probed with OPTIONS.
    /// 30 seconds by default; `None` disables probing.
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        if let Some(interval) = interval {
            if interval <= Duration::from_secs(1) {
                tracing::warn!(
                    "Keepalive interval of {:?} probes connections very often, consider more than 1 second",
                    interval
                );
            }
        }
        self.config.keepalive_interval = interval;
        self
    }

    /// How long a probe may stay unanswered before the connection is broken.
    /// 30 seconds by default.
    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        if timeout <= Duration::from_secs(1) {
            tracing::warn!(
                "Keepalive timeout of {:?} may break healthy but busy connections, consider more than 5 seconds",
                timeout
            );
        }
        self.config.keepalive_timeout = Some(timeout);
        self
    }

    pub fn schema_agreement_waiter(mut self, waiter: Arc<dyn SchemaAgreementWaiter>) -> Self {
        self.config.schema_agreement_waiter = waiter;
        self
    }

    /// Bound on waiting for schema agreement, 60 seconds by default.
    pub fn schema_agreement_timeout(mut self, timeout: Duration) -> Self {
        self.config.schema_agreement_timeout = timeout;
        self
    }

    /// Whether statements that change the schema return only once hosts
    /// agree on it. On by default.
    pub fn auto_await_schema_agreement(mut self, enabled: bool) -> Self {
        self.config.schema_agreement_automatic_waiting = enabled;
        self
    }

    /// Registers a listener of host up and down events.
    pub fn host_listener(mut self, listener: Arc<dyn HostListener>) -> Self {
        self.config.host_listeners.push(listener);
        self
    }

    /// Forwards server events (topology, status and schema changes) to `sender`.
    pub fn event_sender(mut self, sender: mpsc::Sender<Event>) -> Self {
        self.config.event_sender = Some(sender);
        self
    }

    /// Resolves the known nodes, fills the connection pools and returns the session.
    ///
    /// Fails if no known node resolves or no host accepts a connection.
    /// # Example
    /// ```
    /// # use quorum::client::session::Session;
    /// # use quorum::client::session_builder::SessionBuilder;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .build() // Turns SessionBuilder into Session
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::SessionBuilder;
    use crate::cluster::{ContactPoint, KnownNode};
    use crate::errors::NewSessionError;
    use crate::policies::retry::{ClientTimeoutRetry, FallthroughRetryPolicy};
    use crate::utils::test_utils::{setup_tracing, unused_address, MockNode};
    use crate::Consistency;

    #[test]
    fn add_known_nodes() {
        let addr: SocketAddr = "127.0.0.1:9043".parse().unwrap();
        let builder = SessionBuilder::new()
            .known_nodes(["a.example.com", "b.example.com"])
            .known_node_addr(addr)
            .known_node_in_dc("c.example.com", "dc2");

        assert_eq!(
            builder.config.known_nodes,
            vec![
                KnownNode::Hostname("a.example.com".to_owned()).into(),
                KnownNode::Hostname("b.example.com".to_owned()).into(),
                KnownNode::Address(addr).into(),
                ContactPoint {
                    node: KnownNode::Hostname("c.example.com".to_owned()),
                    datacenter: Some("dc2".to_owned()),
                },
            ]
        );
    }

    #[test]
    fn all_features() {
        let builder = SessionBuilder::new()
            .known_node("127.0.0.1")
            .use_keyspace("ks_name_1", true)
            .user("cassandra", "cassandra")
            .connection_timeout(Duration::from_secs(1))
            .request_timeout(None)
            .consistency(Consistency::Two)
            .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
            .client_timeout_retry(ClientTimeoutRetry::SameHost)
            .keepalive_interval(Some(Duration::from_secs(42)))
            .schema_agreement_timeout(Duration::from_secs(3))
            .auto_await_schema_agreement(false)
            .tcp_nodelay(false);

        let config = &builder.config;
        assert_eq!(config.used_keyspace.as_deref(), Some("ks_name_1"));
        assert!(config.keyspace_case_sensitive);
        assert!(config.authenticator.is_some());
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.consistency, Consistency::Two);
        assert_eq!(config.client_timeout_retry, ClientTimeoutRetry::SameHost);
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(42)));
        assert_eq!(config.schema_agreement_timeout, Duration::from_secs(3));
        assert!(!config.schema_agreement_automatic_waiting);
        assert!(!config.tcp_nodelay);
    }

    #[tokio::test]
    async fn empty_known_nodes_are_rejected() {
        setup_tracing();
        assert_matches!(
            SessionBuilder::new().build().await,
            Err(NewSessionError::EmptyKnownNodesList)
        );
    }

    #[tokio::test]
    async fn bad_keyspace_name_is_rejected_before_connecting() {
        setup_tracing();
        assert_matches!(
            SessionBuilder::new()
                .known_node("127.0.0.1")
                .use_keyspace("not a keyspace!", false)
                .build()
                .await,
            Err(NewSessionError::BadKeyspaceName(_))
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn no_reachable_host_fails_to_connect() {
        setup_tracing();
        let address = unused_address().await;
        let result = SessionBuilder::new()
            .known_node_addr(address)
            .connection_timeout(Duration::from_secs(1))
            .build()
            .await;
        assert_matches!(result, Err(NewSessionError::NoHostConnected(errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].0, address);
        });
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn builds_session_against_reachable_node() {
        setup_tracing();
        let node = MockNode::start().await;
        let session = SessionBuilder::new()
            .known_node_addr(node.address())
            .use_keyspace("ks", false)
            .build()
            .await
            .unwrap();

        assert_eq!(session.get_keyspace().as_deref(), Some("ks"));
        assert_eq!(session.get_hosts().len(), 1);
        assert!(node.accepted_connections() >= 1);
    }
}
