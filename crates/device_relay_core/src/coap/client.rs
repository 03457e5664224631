use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::message::{Code, ContentFormat, Message, MessageType};
use super::retransmit::RetransmitTimer;
use crate::config::CoapParams;
use crate::session::{SecureSession, TransportError};

const TOKEN_LEN: usize = 4;
const RECV_BUFFER_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: Code,
    pub content_format: Option<ContentFormat>,
    pub payload: Vec<u8>,
}

impl Response {
    fn from_message(message: Message) -> Self {
        Self {
            code: message.code,
            content_format: message.content_format(),
            payload: message.payload,
        }
    }
}

enum Incoming {
    Piggybacked(Response),
    Acknowledged,
    Separate(Response),
    Reset,
}

/// Confirmable request/response exchange over a secure session. One request
/// is in flight at a time.
pub struct CoapClient<'s, S: SecureSession + ?Sized> {
    session: &'s mut S,
    params: CoapParams,
    rng: StdRng,
    next_message_id: u16,
    recv_buf: Vec<u8>,
}

impl<'s, S: SecureSession + ?Sized> CoapClient<'s, S> {
    pub fn new(session: &'s mut S, params: &CoapParams) -> Self {
        let mut rng = params
            .rng_seed
            .map(StdRng::seed_from_u64)
            .unwrap_or_else(StdRng::from_entropy);
        let next_message_id = rng.gen();

        Self {
            session,
            params: params.clone(),
            rng,
            next_message_id,
            recv_buf: vec![0; RECV_BUFFER_LEN],
        }
    }

    pub fn post(
        &mut self,
        path: &str,
        content_format: ContentFormat,
        body: &[u8],
    ) -> Result<Response, TransportError> {
        let message_id = self.allocate_message_id();
        let token: [u8; TOKEN_LEN] = self.rng.gen();

        let mut request =
            Message::new(MessageType::Confirmable, Code::POST, message_id).with_token(&token);
        request.set_uri_path(path);
        request.set_content_format(content_format);
        request.payload = body.to_vec();

        debug!(
            path,
            message_id,
            %content_format,
            body_len = body.len(),
            "sending confirmable request"
        );
        let datagram = request.encode()?;
        self.exchange(&datagram, message_id, &token)
    }

    fn allocate_message_id(&mut self) -> u16 {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        message_id
    }

    fn exchange(
        &mut self,
        datagram: &[u8],
        message_id: u16,
        token: &[u8],
    ) -> Result<Response, TransportError> {
        let mut timer = RetransmitTimer::new(&self.params, &mut self.rng);
        let mut transmissions = 0u32;

        loop {
            self.session.send(datagram)?;
            transmissions += 1;

            let deadline = Instant::now() + timer.timeout();
            match self.next_incoming(deadline, message_id, token)? {
                Some(Incoming::Piggybacked(response)) | Some(Incoming::Separate(response)) => {
                    return Ok(response);
                }
                Some(Incoming::Acknowledged) => return self.await_separate(message_id, token),
                Some(Incoming::Reset) => return Err(TransportError::Reset { message_id }),
                None => {}
            }

            if !timer.can_retry() {
                return Err(TransportError::Timeout { transmissions });
            }
            timer.attempt();
            debug!(message_id, transmissions, timeout = ?timer.timeout(), "retransmitting");
        }
    }

    fn await_separate(&mut self, message_id: u16, token: &[u8]) -> Result<Response, TransportError> {
        let waited = self.params.response_timeout;
        let deadline = Instant::now() + waited;
        debug!(message_id, "request acknowledged, awaiting separate response");

        loop {
            match self.next_incoming(deadline, message_id, token)? {
                Some(Incoming::Separate(response)) => return Ok(response),
                Some(Incoming::Reset) => return Err(TransportError::Reset { message_id }),
                // Duplicate ACKs of the request.
                Some(Incoming::Piggybacked(_)) | Some(Incoming::Acknowledged) => {}
                None => return Err(TransportError::ResponseTimeout { waited }),
            }
        }
    }

    /// Reads until a datagram relevant to the outstanding request arrives or
    /// `deadline` passes.
    fn next_incoming(
        &mut self,
        deadline: Instant,
        message_id: u16,
        token: &[u8],
    ) -> Result<Option<Incoming>, TransportError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                return Ok(None);
            }

            let Some(len) = self.session.recv(&mut self.recv_buf, remaining)? else {
                return Ok(None);
            };

            let message = match Message::decode(&self.recv_buf[..len]) {
                Ok(message) => message,
                Err(error) => {
                    debug!(%error, len, "ignoring undecodable datagram");
                    continue;
                }
            };

            if let Some(incoming) = self.classify(message, message_id, token)? {
                return Ok(Some(incoming));
            }
        }
    }

    fn classify(
        &mut self,
        message: Message,
        message_id: u16,
        token: &[u8],
    ) -> Result<Option<Incoming>, TransportError> {
        match message.message_type {
            MessageType::Acknowledgement if message.message_id == message_id => {
                if message.code.is_empty() {
                    Ok(Some(Incoming::Acknowledged))
                } else if message.token == token {
                    Ok(Some(Incoming::Piggybacked(Response::from_message(message))))
                } else {
                    debug!(message_id, "ignoring acknowledgement with foreign token");
                    Ok(None)
                }
            }
            MessageType::Reset if message.message_id == message_id => Ok(Some(Incoming::Reset)),
            MessageType::Confirmable | MessageType::NonConfirmable
                if message.code.is_response() && message.token == token =>
            {
                if message.message_type == MessageType::Confirmable {
                    self.send_message(&Message::empty_ack(message.message_id))?;
                }
                Ok(Some(Incoming::Separate(Response::from_message(message))))
            }
            MessageType::Confirmable if message.code.is_empty() => {
                // CoAP ping.
                self.send_message(&Message::reset(message.message_id))?;
                Ok(None)
            }
            _ => {
                debug!(
                    message_type = ?message.message_type,
                    code = %message.code,
                    message_id = message.message_id,
                    "ignoring unrelated message"
                );
                Ok(None)
            }
        }
    }

    fn send_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let datagram = message.encode()?;
        self.session.send(&datagram)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    type Responder = Box<dyn FnMut(&Message) -> Vec<Vec<u8>>>;

    struct ScriptedSession {
        sent: Vec<Message>,
        inbox: VecDeque<Vec<u8>>,
        responder: Responder,
    }

    impl ScriptedSession {
        fn new(responder: impl FnMut(&Message) -> Vec<Vec<u8>> + 'static) -> Self {
            Self {
                sent: Vec::new(),
                inbox: VecDeque::new(),
                responder: Box::new(responder),
            }
        }
    }

    impl SecureSession for ScriptedSession {
        fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
            let message = Message::decode(datagram)?;
            let replies = (self.responder)(&message);
            self.inbox.extend(replies);
            self.sent.push(message);
            Ok(())
        }

        fn recv(
            &mut self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<Option<usize>, TransportError> {
            let Some(datagram) = self.inbox.pop_front() else {
                return Ok(None);
            };
            buf[..datagram.len()].copy_from_slice(&datagram);
            Ok(Some(datagram.len()))
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn params() -> CoapParams {
        CoapParams {
            rng_seed: Some(11),
            ..CoapParams::default()
        }
    }

    fn encoded(message: Message) -> Vec<u8> {
        message.encode().expect("encode")
    }

    fn piggybacked(request: &Message, code: Code) -> Vec<u8> {
        encoded(
            Message::new(MessageType::Acknowledgement, code, request.message_id)
                .with_token(&request.token),
        )
    }

    fn is_request(message: &Message) -> bool {
        message.code == Code::POST
    }

    #[test]
    fn returns_piggybacked_response() {
        let mut session = ScriptedSession::new(|request| vec![piggybacked(request, Code::CREATED)]);

        let response = CoapClient::new(&mut session, &params())
            .post("/auth/jwt", ContentFormat::TEXT_PLAIN, b"token")
            .expect("post should succeed");

        assert_eq!(response.code, Code::CREATED);
        assert_eq!(session.sent.len(), 1);

        let request = &session.sent[0];
        assert_eq!(request.message_type, MessageType::Confirmable);
        assert_eq!(request.uri_path(), "/auth/jwt");
        assert_eq!(request.content_format(), Some(ContentFormat::TEXT_PLAIN));
        assert_eq!(request.token.len(), 4);
        assert_eq!(request.payload, b"token");
    }

    #[test]
    fn retransmits_lost_request_with_same_identity() {
        let mut calls = 0;
        let mut session = ScriptedSession::new(move |request| {
            calls += 1;
            if calls == 1 {
                Vec::new()
            } else {
                vec![piggybacked(request, Code::CREATED)]
            }
        });

        let response = CoapClient::new(&mut session, &params())
            .post("/msg/d2c/raw", ContentFormat::APPLICATION_CBOR, &[0xA0])
            .expect("post should succeed");

        assert_eq!(response.code, Code::CREATED);
        assert_eq!(session.sent.len(), 2);
        assert_eq!(session.sent[0], session.sent[1]);
    }

    #[test]
    fn waits_for_separate_response_and_acknowledges_it() {
        let mut session = ScriptedSession::new(|request| {
            if !is_request(request) {
                return Vec::new();
            }
            let mut separate = Message::new(MessageType::Confirmable, Code::CREATED, 0x7000)
                .with_token(&request.token);
            separate.payload = b"ok".to_vec();
            vec![
                encoded(Message::empty_ack(request.message_id)),
                encoded(separate),
            ]
        });

        let response = CoapClient::new(&mut session, &params())
            .post("/auth/jwt", ContentFormat::TEXT_PLAIN, b"token")
            .expect("post should succeed");

        assert_eq!(response.code, Code::CREATED);
        assert_eq!(response.payload, b"ok");
        assert_eq!(session.sent.len(), 2);
        assert_eq!(session.sent[1], Message::empty_ack(0x7000));
    }

    #[test]
    fn acknowledged_request_without_response_times_out() {
        let mut session = ScriptedSession::new(|request| {
            vec![encoded(Message::empty_ack(request.message_id))]
        });

        let error = CoapClient::new(&mut session, &params())
            .post("/auth/jwt", ContentFormat::TEXT_PLAIN, b"token")
            .expect_err("post should fail");

        assert_eq!(
            error,
            TransportError::ResponseTimeout {
                waited: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn silent_peer_exhausts_retransmissions() {
        let mut session = ScriptedSession::new(|_| Vec::new());

        let error = CoapClient::new(&mut session, &params())
            .post("/auth/jwt", ContentFormat::TEXT_PLAIN, b"token")
            .expect_err("post should fail");

        assert_eq!(error, TransportError::Timeout { transmissions: 5 });
        assert_eq!(session.sent.len(), 5);
    }

    #[test]
    fn reset_aborts_the_exchange() {
        let mut session =
            ScriptedSession::new(|request| vec![encoded(Message::reset(request.message_id))]);

        let mut client = CoapClient::new(&mut session, &params());
        let error = client
            .post("/auth/jwt", ContentFormat::TEXT_PLAIN, b"token")
            .expect_err("post should fail");

        assert!(matches!(error, TransportError::Reset { .. }));
    }

    #[test]
    fn ignores_noise_and_answers_pings() {
        let mut session = ScriptedSession::new(|request| {
            if !is_request(request) {
                return Vec::new();
            }
            vec![
                vec![0xFF, 0x00],
                encoded(Message::empty_ack(request.message_id.wrapping_add(9))),
                encoded(Message::new(MessageType::Confirmable, Code::EMPTY, 0x4242)),
                piggybacked(request, Code::CREATED),
            ]
        });

        let response = CoapClient::new(&mut session, &params())
            .post("/auth/jwt", ContentFormat::TEXT_PLAIN, b"token")
            .expect("post should succeed");

        assert_eq!(response.code, Code::CREATED);
        assert_eq!(session.sent.len(), 2);
        assert_eq!(session.sent[1], Message::reset(0x4242));
    }

    #[test]
    fn message_ids_are_sequential_and_tokens_fresh() {
        let mut session = ScriptedSession::new(|request| vec![piggybacked(request, Code::CREATED)]);

        let mut client = CoapClient::new(&mut session, &params());
        client
            .post("/auth/jwt", ContentFormat::TEXT_PLAIN, b"token")
            .expect("first post");
        client
            .post("/msg/d2c/raw", ContentFormat::APPLICATION_CBOR, &[0x01])
            .expect("second post");

        let first = &session.sent[0];
        let second = &session.sent[1];
        assert_eq!(second.message_id, first.message_id.wrapping_add(1));
        assert_ne!(first.token, second.token);
    }

    #[test]
    fn returns_error_codes_as_responses() {
        let mut session =
            ScriptedSession::new(|request| vec![piggybacked(request, Code::UNAUTHORIZED)]);

        let response = CoapClient::new(&mut session, &params())
            .post("/auth/jwt", ContentFormat::TEXT_PLAIN, b"token")
            .expect("post should succeed");

        assert_eq!(response.code, Code::UNAUTHORIZED);
    }
}
