use std::time::Duration;

use crate::contract::{Endpoint, ValidationError};
use crate::session::TransportOptions;

/// CoAP transmission parameters (RFC 7252 §4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct CoapParams {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    /// How long to wait for a separate response once the request was
    /// acknowledged with an empty ACK.
    pub response_timeout: Duration,
    /// Seeds message ids, tokens and retransmission jitter. Tests only.
    pub rng_seed: Option<u64>,
}

impl Default for CoapParams {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            response_timeout: Duration::from_secs(30),
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelayConfig {
    pub endpoint: Endpoint,
    pub transport: TransportOptions,
    pub coap: CoapParams,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.coap.ack_timeout.is_zero() {
            return Err(ValidationError::new("ack_timeout must be positive"));
        }
        if !self.coap.ack_random_factor.is_finite() || self.coap.ack_random_factor < 1.0 {
            return Err(ValidationError::new(
                "ack_random_factor must be a finite number >= 1.0",
            ));
        }
        if self.coap.response_timeout.is_zero() {
            return Err(ValidationError::new("response_timeout must be positive"));
        }
        if self.transport.handshake_timeout.is_zero() {
            return Err(ValidationError::new("handshake_timeout must be positive"));
        }
        Ok(())
    }
}
