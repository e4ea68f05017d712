//! TLS layer of driver connections.
//!
//! A [`TlsContext`] is supplied once in the session configuration and shared
//! by every connection; each connection turns it into a connector and wraps
//! its freshly opened TCP stream before the first frame is written.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

/// TLS configuration shared by all connections of a session.
///
/// Without the `rustls-023` feature this enum has no variants, so a
/// connection can never be configured to use TLS.
#[derive(Clone)]
#[non_exhaustive]
pub enum TlsContext {
    #[cfg(feature = "rustls-023")]
    Rustls023 {
        config: Arc<rustls::ClientConfig>,
        /// Name to verify the node's certificate against. The node's IP
        /// address is used if absent.
        server_name: Option<String>,
    },
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[allow(unreachable_code)]
        match *self {
            #[cfg(feature = "rustls-023")]
            TlsContext::Rustls023 {
                ref server_name, ..
            } => f
                .debug_struct("TlsContext::Rustls023")
                .field("server_name", server_name)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "rustls-023")]
impl From<Arc<rustls::ClientConfig>> for TlsContext {
    fn from(config: Arc<rustls::ClientConfig>) -> Self {
        TlsContext::Rustls023 {
            config,
            server_name: None,
        }
    }
}

/// A wrapper around an error reported by the TLS backend.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum TlsError {
    #[error("Invalid server name for TLS verification: {0}")]
    InvalidName(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(Arc<io::Error>),
}

/// The TCP stream after the TLS handshake.
#[cfg(feature = "rustls-023")]
pub(crate) type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

impl TlsContext {
    /// Performs the client side of the TLS handshake over `stream`.
    #[cfg(feature = "rustls-023")]
    pub(crate) async fn connect(
        &self,
        stream: TcpStream,
        node_ip: IpAddr,
    ) -> Result<TlsStream, TlsError> {
        use rustls::pki_types::ServerName;

        match self {
            TlsContext::Rustls023 {
                config,
                server_name,
            } => {
                let server_name = match server_name {
                    Some(name) => ServerName::try_from(name.clone())
                        .map_err(|_| TlsError::InvalidName(name.clone()))?,
                    None => ServerName::IpAddress(node_ip.into()),
                };
                let connector = tokio_rustls::TlsConnector::from(config.clone());
                connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|err| TlsError::Handshake(Arc::new(err)))
            }
        }
    }

    /// Without a TLS backend there is no context value to call this on.
    #[cfg(not(feature = "rustls-023"))]
    pub(crate) async fn connect(
        &self,
        _stream: TcpStream,
        _node_ip: IpAddr,
    ) -> Result<TcpStream, TlsError> {
        match *self {}
    }
}
