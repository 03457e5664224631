//! Test helpers: device key generation and an in-memory CoAP broker that
//! stands in for the DTLS session.
//!
//! Shared by unit tests, the integration tests and the Lambda crate's handler
//! tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use p256::pkcs8::{EncodePrivateKey, LineEnding};
use p256::{PublicKey, SecretKey};

use crate::coap::{Code, ContentFormat, Message, MessageType};
use crate::contract::{DeviceEvent, Endpoint, AUTH_PATH, RELAY_PATH};
use crate::credential;
use crate::session::{SecureSession, SessionConnector, TransportError, TransportOptions};

/// `EC PARAMETERS` block for prime256v1, as emitted by `openssl ecparam -genkey`.
const P256_PARAMETERS_PEM: &str =
    "-----BEGIN EC PARAMETERS-----\nBggqhkjOPQMBBw==\n-----END EC PARAMETERS-----\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    Sec1,
    /// SEC1 preceded by an `EC PARAMETERS` block.
    Sec1WithParameters,
    Pkcs8,
}

/// Generates a fresh P-256 key and returns its PEM text with the matching
/// public key.
///
/// # Panics
///
/// Panics if the freshly generated key cannot be PEM encoded (should never happen).
pub fn generate_key_pem(encoding: KeyEncoding) -> (String, PublicKey) {
    let secret = SecretKey::random(&mut rand::rngs::OsRng);
    let public_key = secret.public_key();

    let pem = match encoding {
        KeyEncoding::Sec1 => secret
            .to_sec1_pem(LineEnding::LF)
            .expect("SEC1 encoding")
            .to_string(),
        KeyEncoding::Sec1WithParameters => format!(
            "{P256_PARAMETERS_PEM}{}",
            secret.to_sec1_pem(LineEnding::LF).expect("SEC1 encoding").as_str()
        ),
        KeyEncoding::Pkcs8 => secret
            .to_pkcs8_pem(LineEnding::LF)
            .expect("PKCS#8 encoding")
            .to_string(),
    };

    (pem, public_key)
}

/// 2026-03-01T12:00:00Z.
///
/// # Panics
///
/// Never; the timestamp is a valid calendar date.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub fn device_event(device_id: &str, private_key: &str, payload: &str) -> DeviceEvent {
    DeviceEvent {
        device_id: device_id.to_string(),
        private_key: private_key.to_string(),
        name: None,
        host: None,
        port: None,
        payload: payload.to_string(),
    }
}

/// Verifies the `/auth/jwt` body against a known public key.
#[derive(Debug, Clone)]
pub struct CredentialCheck {
    pub public_key: PublicKey,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BrokerBehavior {
    pub auth_code: Code,
    pub relay_code: Code,
    /// Datagrams from the client silently discarded before the broker starts
    /// answering.
    pub drop_first_datagrams: usize,
    /// Answer with an empty ACK followed by a confirmable separate response.
    pub separate_responses: bool,
    /// Never answer.
    pub silent: bool,
    pub fail_connect: Option<TransportError>,
    pub fail_close: bool,
    /// Send a CoAP ping ahead of every response.
    pub ping_before_response: bool,
    /// Rejects `/auth/jwt` with 4.01 when the token does not verify.
    pub credential_check: Option<CredentialCheck>,
}

impl Default for BrokerBehavior {
    fn default() -> Self {
        Self {
            auth_code: Code::CREATED,
            relay_code: Code::CREATED,
            drop_first_datagrams: 0,
            separate_responses: false,
            silent: false,
            fail_connect: None,
            fail_close: false,
            ping_before_response: false,
            credential_check: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub message_id: u16,
    pub path: String,
    pub content_format: Option<ContentFormat>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct BrokerLog {
    pub connects: Vec<Endpoint>,
    pub connect_options: Vec<TransportOptions>,
    pub closes: usize,
    /// Every datagram the client sent, including dropped ones.
    pub datagrams: usize,
    /// Requests in arrival order; retransmissions are recorded once.
    pub requests: Vec<RecordedRequest>,
    pub acks: Vec<u16>,
    pub resets: Vec<u16>,
    pub authenticated_subjects: Vec<String>,
}

impl BrokerLog {
    pub fn paths(&self) -> Vec<&str> {
        self.requests
            .iter()
            .map(|request| request.path.as_str())
            .collect()
    }
}

/// In-memory broker. Clones share one [`BrokerLog`].
#[derive(Debug, Clone)]
pub struct FakeBroker {
    behavior: BrokerBehavior,
    log: Arc<Mutex<BrokerLog>>,
}

impl FakeBroker {
    pub fn new(behavior: BrokerBehavior) -> Self {
        Self {
            behavior,
            log: Arc::new(Mutex::new(BrokerLog::default())),
        }
    }

    pub fn accepting() -> Self {
        Self::new(BrokerBehavior::default())
    }

    /// Snapshot of everything recorded so far.
    pub fn log(&self) -> BrokerLog {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerLog> {
        self.log.lock().expect("poisoned mutex")
    }

    fn respond_code(&self, request: &Message, first_seen: bool) -> Code {
        match request.uri_path().as_str() {
            AUTH_PATH => {
                let Some(check) = &self.behavior.credential_check else {
                    return self.behavior.auth_code;
                };
                let token = String::from_utf8_lossy(&request.payload);
                match credential::verify(&token, &check.public_key, check.now) {
                    Ok(claims) => {
                        if first_seen {
                            self.lock().authenticated_subjects.push(claims.sub);
                        }
                        self.behavior.auth_code
                    }
                    Err(_) => Code::UNAUTHORIZED,
                }
            }
            RELAY_PATH => self.behavior.relay_code,
            _ => Code::NOT_FOUND,
        }
    }
}

impl SessionConnector for FakeBroker {
    type Session = FakeSession;

    fn connect(
        &self,
        endpoint: &Endpoint,
        options: &TransportOptions,
    ) -> Result<FakeSession, TransportError> {
        {
            let mut log = self.lock();
            log.connects.push(endpoint.clone());
            log.connect_options.push(options.clone());
        }

        if let Some(error) = &self.behavior.fail_connect {
            return Err(error.clone());
        }

        Ok(FakeSession {
            broker: self.clone(),
            outbox: VecDeque::new(),
            received: 0,
            next_message_id: 0x7000,
            closed: false,
        })
    }
}

pub struct FakeSession {
    broker: FakeBroker,
    outbox: VecDeque<Vec<u8>>,
    received: usize,
    next_message_id: u16,
    closed: bool,
}

impl FakeSession {
    fn push(&mut self, message: Message) -> Result<(), TransportError> {
        self.outbox.push_back(message.encode()?);
        Ok(())
    }

    fn allocate_message_id(&mut self) -> u16 {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        message_id
    }

    fn handle_request(&mut self, request: Message) -> Result<(), TransportError> {
        let first_seen = {
            let mut log = self.broker.lock();
            let first_seen = !log
                .requests
                .iter()
                .any(|recorded| recorded.message_id == request.message_id);
            if first_seen {
                log.requests.push(RecordedRequest {
                    message_id: request.message_id,
                    path: request.uri_path(),
                    content_format: request.content_format(),
                    payload: request.payload.clone(),
                });
            }
            first_seen
        };

        let code = self.broker.respond_code(&request, first_seen);

        if self.broker.behavior.ping_before_response {
            let ping_id = self.allocate_message_id();
            self.push(Message::new(MessageType::Confirmable, Code::EMPTY, ping_id))?;
        }

        if self.broker.behavior.separate_responses {
            self.push(Message::empty_ack(request.message_id))?;
            let response_id = self.allocate_message_id();
            self.push(
                Message::new(MessageType::Confirmable, code, response_id)
                    .with_token(&request.token),
            )
        } else {
            self.push(
                Message::new(MessageType::Acknowledgement, code, request.message_id)
                    .with_token(&request.token),
            )
        }
    }
}

impl SecureSession for FakeSession {
    fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        self.broker.lock().datagrams += 1;
        self.received += 1;
        if self.received <= self.broker.behavior.drop_first_datagrams || self.broker.behavior.silent
        {
            return Ok(());
        }

        let Ok(message) = Message::decode(datagram) else {
            return Ok(());
        };

        match message.message_type {
            MessageType::Acknowledgement if message.code.is_empty() => {
                self.broker.lock().acks.push(message.message_id);
                Ok(())
            }
            MessageType::Reset => {
                self.broker.lock().resets.push(message.message_id);
                Ok(())
            }
            MessageType::Confirmable if message.code.is_request() => self.handle_request(message),
            _ => Ok(()),
        }
    }

    fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<Option<usize>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let Some(datagram) = self.outbox.pop_front() else {
            return Ok(None);
        };
        if datagram.len() > buf.len() {
            return Err(TransportError::Io(format!(
                "datagram of {} bytes exceeds receive buffer",
                datagram.len()
            )));
        }
        buf[..datagram.len()].copy_from_slice(&datagram);
        Ok(Some(datagram.len()))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.broker.lock().closes += 1;
        if self.broker.behavior.fail_close {
            return Err(TransportError::Io("close_notify failed".to_string()));
        }
        Ok(())
    }
}
