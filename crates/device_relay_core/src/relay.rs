//! The authenticate-then-relay sequence.
//!
//! validate → parse key → issue credential → connect → `POST /auth/jwt` →
//! decode payload → `POST /msg/d2c/raw`. The session is released on every exit
//! once opened.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn};

use crate::coap::{Code, CoapClient, ContentFormat};
use crate::config::RelayConfig;
use crate::contract::{DeviceEvent, RelayResponse, ValidationError, AUTH_PATH, RELAY_PATH};
use crate::credential;
use crate::error::RelayError;
use crate::key::parse_private_key;
use crate::payload::decode_hex_payload;
use crate::session::{SecureSession, SessionConnector, SessionGuard};

/// Runs one relay invocation.
///
/// Input errors (absent event, malformed hex) are answered with
/// `{"statusCode": 400}`; every other failure is returned as `Err`.
pub fn relay_event<C: SessionConnector>(
    event: Option<&DeviceEvent>,
    config: &RelayConfig,
    connector: &C,
    now: DateTime<Utc>,
) -> Result<RelayResponse, RelayError> {
    let result = match event {
        Some(event) => info_span!("relay", device_id = %event.device_id)
            .in_scope(|| run(event, config, connector, now)),
        None => Err(ValidationError::new("event is required").into()),
    };

    match result {
        Ok(response) => Ok(response),
        Err(error) => match error.status_code() {
            Some(status_code) => {
                warn!(kind = error.kind(), %error, status_code, "rejecting invocation input");
                Ok(RelayResponse { status_code })
            }
            None => {
                error!(kind = error.kind(), %error, "relay failed");
                Err(error)
            }
        },
    }
}

fn run<C: SessionConnector>(
    event: &DeviceEvent,
    config: &RelayConfig,
    connector: &C,
    now: DateTime<Utc>,
) -> Result<RelayResponse, RelayError> {
    if event.host.is_some() || event.port.is_some() {
        debug!(
            host = ?event.host,
            port = ?event.port,
            endpoint = %config.endpoint,
            "ignoring event host/port, using configured endpoint"
        );
    }

    let key = parse_private_key(&event.private_key)?;
    let token = credential::issue(&key, &event.device_id, now)?;
    info!(key_fingerprint = %key.fingerprint(), "credential issued");
    debug!(token_len = token.len(), "credential length");

    let mut session = SessionGuard::new(connector.connect(&config.endpoint, &config.transport)?);
    info!(endpoint = %config.endpoint, "session established");

    let mut client = CoapClient::new(&mut *session, &config.coap);
    post_expecting_created(
        &mut client,
        AUTH_PATH,
        ContentFormat::TEXT_PLAIN,
        token.as_bytes(),
    )?;
    info!("authenticated");

    debug!(payload = %event.payload, "decoding payload");
    let payload = decode_hex_payload(&event.payload)?;
    post_expecting_created(
        &mut client,
        RELAY_PATH,
        ContentFormat::APPLICATION_CBOR,
        &payload,
    )?;
    info!(payload_len = payload.len(), "payload relayed");

    if let Err(error) = session.close() {
        warn!(%error, "failed to close session");
    }

    Ok(RelayResponse::ok())
}

fn post_expecting_created<S: SecureSession + ?Sized>(
    client: &mut CoapClient<'_, S>,
    path: &str,
    content_format: ContentFormat,
    body: &[u8],
) -> Result<(), RelayError> {
    let response = client.post(path, content_format, body)?;
    if response.code != Code::CREATED {
        return Err(RelayError::UnexpectedResponseStatus {
            path: path.to_string(),
            expected: Code::CREATED,
            actual: response.code,
        });
    }
    Ok(())
}
