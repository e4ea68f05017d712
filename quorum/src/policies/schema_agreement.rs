//! Waiting for schema agreement after DDL statements.
//!
//! A schema change is applied by one coordinator and then propagated. Until
//! every node reports the same schema version, statements relying on the
//! change may fail on some of them.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::SchemaAgreementError;

/// Reports the schema version seen by every reachable host.
#[async_trait]
pub trait SchemaVersionSource: Send + Sync {
    /// One entry per host that answered. Hosts whose every connection is
    /// broken are skipped; an empty result is an error.
    async fn schema_versions(&self) -> Result<Vec<(SocketAddr, Uuid)>, SchemaAgreementError>;
}

/// Decides when the cluster agrees on its schema.
///
/// The session bounds the wait with its schema agreement timeout.
#[async_trait]
pub trait SchemaAgreementWaiter: std::fmt::Debug + Send + Sync {
    /// Resolves to the agreed version.
    async fn wait_for_agreement(
        &self,
        source: &dyn SchemaVersionSource,
    ) -> Result<Uuid, SchemaAgreementError>;
}

/// Returns the agreed version if every host reports the same one.
pub fn agreed_version(versions: &[(SocketAddr, Uuid)]) -> Option<Uuid> {
    let (_, first) = versions.first()?;
    versions
        .iter()
        .all(|(_, version)| version == first)
        .then_some(*first)
}

/// Asks every host for its schema version each `interval`, until they agree.
#[derive(Debug, Clone)]
pub struct PollingSchemaAgreementWaiter {
    interval: Duration,
}

impl PollingSchemaAgreementWaiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for PollingSchemaAgreementWaiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

#[async_trait]
impl SchemaAgreementWaiter for PollingSchemaAgreementWaiter {
    async fn wait_for_agreement(
        &self,
        source: &dyn SchemaVersionSource,
    ) -> Result<Uuid, SchemaAgreementError> {
        loop {
            let versions = source.schema_versions().await?;
            if let Some(version) = agreed_version(&versions) {
                debug!(%version, hosts = versions.len(), "Schema agreement reached");
                return Ok(version);
            }
            trace!(?versions, "No schema agreement yet");
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use uuid::Uuid;

    use super::{
        agreed_version, PollingSchemaAgreementWaiter, SchemaAgreementWaiter, SchemaVersionSource,
    };
    use crate::errors::SchemaAgreementError;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Disagrees for the first `disagreements` polls.
    struct Converging {
        disagreements: usize,
        polls: AtomicUsize,
        agreed: Uuid,
    }

    #[async_trait]
    impl SchemaVersionSource for Converging {
        async fn schema_versions(&self) -> Result<Vec<(SocketAddr, Uuid)>, SchemaAgreementError> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst);
            let second = if poll < self.disagreements {
                Uuid::new_v4()
            } else {
                self.agreed
            };
            Ok(vec![(addr(1), self.agreed), (addr(2), second)])
        }
    }

    struct Unreachable;

    #[async_trait]
    impl SchemaVersionSource for Unreachable {
        async fn schema_versions(&self) -> Result<Vec<(SocketAddr, Uuid)>, SchemaAgreementError> {
            Err(SchemaAgreementError::NoConnections)
        }
    }

    #[test]
    fn agreement_requires_identical_versions() {
        let version = Uuid::new_v4();
        assert_eq!(agreed_version(&[]), None);
        assert_eq!(
            agreed_version(&[(addr(1), version), (addr(2), version)]),
            Some(version)
        );
        assert_eq!(
            agreed_version(&[(addr(1), version), (addr(2), Uuid::new_v4())]),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_versions_converge() {
        let source = Converging {
            disagreements: 3,
            polls: AtomicUsize::new(0),
            agreed: Uuid::new_v4(),
        };
        let waiter = PollingSchemaAgreementWaiter::new(Duration::from_millis(100));
        let version = waiter.wait_for_agreement(&source).await.unwrap();
        assert_eq!(version, source.agreed);
        assert_eq!(source.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn source_errors_end_the_wait() {
        let waiter = PollingSchemaAgreementWaiter::default();
        assert_matches!(
            waiter.wait_for_agreement(&Unreachable).await,
            Err(SchemaAgreementError::NoConnections)
        );
    }
}
