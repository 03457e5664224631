use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_ENDPOINT: &str = "coap.nrfcloud.com:5684";
pub const AUTH_PATH: &str = "/auth/jwt";
pub const RELAY_PATH: &str = "/msg/d2c/raw";

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Invocation input as delivered by the device-management event source.
///
/// `name`, `host` and `port` are carried for logging only; the broker address
/// comes from deployment configuration.
///
/// Absent or null string fields read as empty, so they fail later in the
/// step that needs them (key parsing, signing) or, for `payload`, relay an
/// empty body.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub device_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub private_key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEvent")
            .field("device_id", &self.device_id)
            .field("private_key", &format_args!("<{} bytes>", self.private_key.len()))
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("payload", &self.payload)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

impl RelayResponse {
    pub fn ok() -> Self {
        Self {
            status_code: STATUS_OK,
        }
    }

    pub fn bad_request() -> Self {
        Self {
            status_code: STATUS_BAD_REQUEST,
        }
    }
}

/// `host:port` of the CoAP broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, accepting bracketed IPv6 literals (`[::1]:5684`).
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let value = value.trim();
        let Some((host, port)) = value.rsplit_once(':') else {
            return Err(ValidationError::new(format!(
                "endpoint '{value}' must be of the form host:port"
            )));
        };

        let host = host
            .strip_prefix('[')
            .and_then(|inner| inner.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(ValidationError::new(format!(
                "endpoint '{value}' has an empty host"
            )));
        }

        let port = port.parse::<u16>().map_err(|error| {
            ValidationError::new(format!("endpoint '{value}' has an invalid port: {error}"))
        })?;
        if port == 0 {
            return Err(ValidationError::new(format!(
                "endpoint '{value}' must not use port 0"
            )));
        }

        Ok(Self::new(host, port))
    }

    /// Address string suitable for socket resolution.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("coap.nrfcloud.com", 5684)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}
