use thiserror::Error;

use crate::coap::Code;
use crate::contract::{ValidationError, STATUS_BAD_REQUEST};
use crate::credential::CredentialError;
use crate::key::KeyParseError;
use crate::session::TransportError;

/// Everything that can stop a relay invocation.
///
/// Input problems carry a status code and are answered with a response;
/// the rest are invocation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    /// The event is present but is not a device event at all (e.g. not an
    /// object, or a field of the wrong type).
    #[error("event does not match the device event shape: {0}")]
    MalformedEvent(String),

    #[error("payload is not valid hex: {0}")]
    PayloadDecode(#[from] hex::FromHexError),

    #[error("failed to parse device key: {0}")]
    KeyParse(#[from] KeyParseError),

    #[error("failed to issue credential: {0}")]
    Signing(#[from] CredentialError),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("{path} answered {actual}, expected {expected}")]
    UnexpectedResponseStatus {
        path: String,
        expected: Code,
        actual: Code,
    },
}

impl RelayError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RelayError::Validation(_) | RelayError::PayloadDecode(_) => Some(STATUS_BAD_REQUEST),
            _ => None,
        }
    }

    /// Stable label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation",
            RelayError::MalformedEvent(_) => "malformed_event",
            RelayError::PayloadDecode(_) => "payload_decode",
            RelayError::KeyParse(_) => "key_parse",
            RelayError::Signing(_) => "signing",
            RelayError::Transport(_) => "transport",
            RelayError::UnexpectedResponseStatus { .. } => "unexpected_response_status",
        }
    }
}
