#![allow(dead_code)]

use device_relay_core::config::RelayConfig;
use device_relay_core::contract::DeviceEvent;
use device_relay_core::test_helpers::{
    device_event, fixed_now, generate_key_pem, BrokerBehavior, CredentialCheck, KeyEncoding,
};

/// A device with a freshly generated key and a broker behaviour that checks
/// the credential it presents.
pub struct TestDevice {
    pub event: DeviceEvent,
    pub check: CredentialCheck,
}

impl TestDevice {
    pub fn new(device_id: &str, payload: &str) -> Self {
        let (pem, public_key) = generate_key_pem(KeyEncoding::Sec1WithParameters);
        Self {
            event: device_event(device_id, &pem, payload),
            check: CredentialCheck {
                public_key,
                now: fixed_now(),
            },
        }
    }

    /// Broker behaviour that rejects tokens not signed by this device.
    pub fn verifying_broker(&self) -> BrokerBehavior {
        BrokerBehavior {
            credential_check: Some(self.check.clone()),
            ..BrokerBehavior::default()
        }
    }
}

/// Default configuration with a deterministic CoAP random source.
pub fn seeded_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.coap.rng_seed = Some(0x5eed);
    config
}
