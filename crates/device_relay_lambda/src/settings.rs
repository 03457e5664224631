//! Relay configuration from the function's environment.
//!
//! | Variable                      | Default                  |
//! |-------------------------------|--------------------------|
//! | `RELAY_ENDPOINT`              | `coap.nrfcloud.com:5684` |
//! | `RELAY_INSECURE_SKIP_VERIFY`  | `false`                  |
//! | `RELAY_ACK_TIMEOUT_MS`        | `2000`                   |
//! | `RELAY_MAX_RETRANSMIT`        | `4`                      |
//! | `RELAY_RESPONSE_TIMEOUT_MS`   | `30000`                  |
//! | `RELAY_HANDSHAKE_TIMEOUT_MS`  | `30000`                  |
//! | `RELAY_CA_PEM`                | unset (public roots only) |
//!
//! `RELAY_CA_PEM` holds either PEM certificates inline or the path of a PEM
//! file shipped with the function. Empty values count as unset.

use std::str::FromStr;
use std::time::Duration;

use device_relay_core::config::RelayConfig;
use device_relay_core::contract::{Endpoint, ValidationError};
use rustls::pki_types::CertificateDer;
use thiserror::Error;

pub const ENV_ENDPOINT: &str = "RELAY_ENDPOINT";
pub const ENV_INSECURE_SKIP_VERIFY: &str = "RELAY_INSECURE_SKIP_VERIFY";
pub const ENV_ACK_TIMEOUT_MS: &str = "RELAY_ACK_TIMEOUT_MS";
pub const ENV_MAX_RETRANSMIT: &str = "RELAY_MAX_RETRANSMIT";
pub const ENV_RESPONSE_TIMEOUT_MS: &str = "RELAY_RESPONSE_TIMEOUT_MS";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "RELAY_HANDSHAKE_TIMEOUT_MS";
pub const ENV_CA_PEM: &str = "RELAY_CA_PEM";

const PEM_BEGIN: &str = "-----BEGIN";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} is invalid: {reason}")]
    InvalidVariable { name: &'static str, reason: String },

    #[error("invalid relay configuration: {0}")]
    Invalid(#[from] ValidationError),
}

pub fn settings_from_env() -> Result<RelayConfig, ConfigError> {
    settings_from_lookup(|name| std::env::var(name).ok())
}

pub fn settings_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<RelayConfig, ConfigError> {
    let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
    let mut config = RelayConfig::default();

    if let Some(value) = read(ENV_ENDPOINT) {
        config.endpoint = Endpoint::parse(&value).map_err(|error| ConfigError::InvalidVariable {
            name: ENV_ENDPOINT,
            reason: error.to_string(),
        })?;
    }
    if let Some(value) = read(ENV_INSECURE_SKIP_VERIFY) {
        config.transport.insecure_skip_verify = parse_bool(ENV_INSECURE_SKIP_VERIFY, &value)?;
    }
    if let Some(value) = read(ENV_ACK_TIMEOUT_MS) {
        config.coap.ack_timeout = parse_millis(ENV_ACK_TIMEOUT_MS, &value)?;
    }
    if let Some(value) = read(ENV_MAX_RETRANSMIT) {
        config.coap.max_retransmit = parse_number(ENV_MAX_RETRANSMIT, &value)?;
    }
    if let Some(value) = read(ENV_RESPONSE_TIMEOUT_MS) {
        config.coap.response_timeout = parse_millis(ENV_RESPONSE_TIMEOUT_MS, &value)?;
    }
    if let Some(value) = read(ENV_HANDSHAKE_TIMEOUT_MS) {
        config.transport.handshake_timeout = parse_millis(ENV_HANDSHAKE_TIMEOUT_MS, &value)?;
    }

    config.validate()?;
    Ok(config)
}

/// Extra trust anchors for the broker certificate, on top of the public roots.
pub fn trust_roots_from_env() -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    trust_roots_from_lookup(|name| std::env::var(name).ok())
}

pub fn trust_roots_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let Some(value) = lookup(ENV_CA_PEM).filter(|value| !value.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    let invalid = |reason: String| ConfigError::InvalidVariable {
        name: ENV_CA_PEM,
        reason,
    };

    let pem = if value.contains(PEM_BEGIN) {
        value.into_bytes()
    } else {
        let path = value.trim();
        std::fs::read(path).map_err(|error| invalid(format!("failed to read '{path}': {error}")))?
    };

    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| invalid(error.to_string()))?;
    if certs.is_empty() {
        return Err(invalid("no CERTIFICATE blocks found".to_string()));
    }
    Ok(certs)
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidVariable {
            name,
            reason: format!("'{other}' is not a boolean"),
        }),
    }
}

fn parse_number<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|error| ConfigError::InvalidVariable {
            name,
            reason: format!("'{}': {error}", value.trim()),
        })
}

fn parse_millis(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(name, value).map(Duration::from_millis)
}
