use chrono::{DateTime, Utc};
use device_relay_core::config::RelayConfig;
use device_relay_core::contract::{DeviceEvent, RelayResponse};
use device_relay_core::error::RelayError;
use device_relay_core::relay::relay_event;
use device_relay_core::session::SessionConnector;
use serde_json::Value;
use tracing::error;

/// Entry point for one invocation.
///
/// A `null` event is answered with 400. An event that is not a device event
/// at all (not an object, mistyped fields) fails the invocation; missing
/// string fields read as empty and fail in the step that needs them.
pub fn handle_relay_event<C: SessionConnector>(
    event: Value,
    config: &RelayConfig,
    connector: &C,
    now: DateTime<Utc>,
) -> Result<RelayResponse, RelayError> {
    if event.is_null() {
        return relay_event(None, config, connector, now);
    }

    let event = match serde_json::from_value::<DeviceEvent>(event) {
        Ok(value) => value,
        Err(error) => {
            let error = RelayError::MalformedEvent(error.to_string());
            error!(kind = error.kind(), %error, "relay failed");
            return Err(error);
        }
    };

    relay_event(Some(&event), config, connector, now)
}
