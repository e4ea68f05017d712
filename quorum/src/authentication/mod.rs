//! Pluggable SASL-style authentication performed during the connection handshake.
//!
//! When a node answers STARTUP with AUTHENTICATE, the connection asks the
//! configured [`AuthenticatorProvider`] for an initial token and a session
//! object, then alternates AUTH_RESPONSE / AUTH_CHALLENGE frames until the
//! node replies with AUTH_SUCCESS.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Human readable reason for a failed authentication step.
pub type AuthError = String;

/// One in-progress authentication exchange on a single connection.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Computes the answer to a server challenge.
    /// The token is mechanism specific and may be absent or empty.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called once the server has accepted the credentials.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Creates an [`AuthenticatorSession`] for every connection that has to authenticate.
///
/// Set it with `SessionBuilder::authenticator_provider`, or use
/// `SessionBuilder::user` for [`PlainTextAuthenticator`].
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Returns the initial response together with the session that will
    /// handle the rest of the exchange. `authenticator_name` is the class
    /// name announced in the AUTHENTICATE frame.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Plain text authentication does not expect challenges".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username and password authentication, sent as `\0username\0password`.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        let mut response =
            BytesMut::with_capacity(2 + self.username.len() + self.password.len());

        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());

        Ok((
            Some(response.to_vec()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}
