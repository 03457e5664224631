//! AWS Lambda integration for the device session relay.
//!
//! This crate owns runtime integration details (the invocation handler,
//! environment settings, log initialisation and the DTLS transport adapter)
//! and re-exports the core relay boundary under [`runtime`].

pub mod adapters;
pub mod handlers;
pub mod settings;
pub mod telemetry;

pub mod runtime {
    pub use device_relay_core::config::{CoapParams, RelayConfig};
    pub use device_relay_core::contract::{DeviceEvent, Endpoint, RelayResponse};
    pub use device_relay_core::error::RelayError;
    pub use device_relay_core::session::{SessionConnector, TransportOptions};
}
