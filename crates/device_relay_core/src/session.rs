//! Secure datagram session seam.
//!
//! The relay sequence only needs to send and receive whole datagrams over an
//! established DTLS session; the concrete stack lives in the Lambda crate.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::coap::CodecError;
use crate::contract::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Skips peer certificate verification. Weakens the session's server
    /// authentication; only enable for brokers whose chain cannot be verified.
    pub insecure_skip_verify: bool,
    pub handshake_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to resolve {endpoint}: {reason}")]
    Resolve { endpoint: String, reason: String },

    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("DTLS handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    #[error("session I/O failed: {0}")]
    Io(String),

    #[error("session is closed")]
    Closed,

    #[error("no acknowledgement after {transmissions} transmissions")]
    Timeout { transmissions: u32 },

    #[error("no response within {waited:?} after acknowledgement")]
    ResponseTimeout { waited: Duration },

    #[error("message {message_id} was reset by the peer")]
    Reset { message_id: u16 },

    #[error("malformed CoAP message: {0}")]
    Codec(#[from] CodecError),
}

pub trait SecureSession {
    fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Waits up to `timeout` for one datagram. `Ok(None)` when nothing arrived.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

pub trait SessionConnector {
    type Session: SecureSession;

    fn connect(
        &self,
        endpoint: &Endpoint,
        options: &TransportOptions,
    ) -> Result<Self::Session, TransportError>;
}

/// Owns an open session and closes it exactly once, either through
/// [`SessionGuard::close`] or when dropped on an early return.
pub struct SessionGuard<S: SecureSession> {
    session: S,
    closed: bool,
}

impl<S: SecureSession> SessionGuard<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            closed: false,
        }
    }

    pub fn close(mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.session.close()
    }
}

impl<S: SecureSession> Deref for SessionGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: SecureSession> DerefMut for SessionGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

impl<S: SecureSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(error) = self.session.close() {
            warn!(%error, "failed to close session");
        }
    }
}
