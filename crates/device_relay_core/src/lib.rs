//! Device session relay domain primitives.
//!
//! This crate owns the authenticate-then-relay exchange: invocation contract,
//! device key parsing, credential issuance, the CoAP message layer and the
//! relay sequence itself. It intentionally excludes the Lambda runtime and any
//! concrete DTLS stack; transports plug in through [`session::SessionConnector`].

pub mod coap;
pub mod config;
pub mod contract;
pub mod credential;
pub mod error;
pub mod key;
pub mod payload;
pub mod relay;
pub mod session;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;
