//! CoAP messages (RFC 7252 §3).
//!
//! Wire encoding is delegated to `coap_lite::Packet`; this module keeps the
//! typed view the client works with and the header checks that decide how a
//! datagram is reported.

use std::fmt;

use coap_lite::{CoapOption as WireOption, MessageClass, MessageType as WireType, Packet};
use thiserror::Error;

pub const VERSION: u8 = 1;
pub const MAX_TOKEN_LEN: usize = 8;

pub const OPTION_URI_PATH: u16 = 11;
pub const OPTION_CONTENT_FORMAT: u16 = 12;

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message truncated")]
    Truncated,

    #[error("unsupported CoAP version {0}")]
    UnsupportedVersion(u8),

    #[error("token length {0} exceeds 8 bytes")]
    TokenTooLong(usize),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("empty message carries a token, options or payload")]
    EmptyMessageWithContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

/// Request method or response code, `class.detail`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);

    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);

    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const FORBIDDEN: Code = Code::new(4, 3);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1F))
    }

    pub fn from_u8(value: u8) -> Self {
        Code(value)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(&self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_request(&self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    pub fn is_response(&self) -> bool {
        (2..=5).contains(&self.class())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    pub const TEXT_PLAIN: ContentFormat = ContentFormat(0);
    pub const OCTET_STREAM: ContentFormat = ContentFormat(42);
    pub const APPLICATION_JSON: ContentFormat = ContentFormat(50);
    pub const APPLICATION_CBOR: ContentFormat = ContentFormat(60);
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ContentFormat::TEXT_PLAIN => f.write_str("text/plain"),
            ContentFormat::OCTET_STREAM => f.write_str("application/octet-stream"),
            ContentFormat::APPLICATION_JSON => f.write_str("application/json"),
            ContentFormat::APPLICATION_CBOR => f.write_str("application/cbor"),
            ContentFormat(other) => write!(f, "content-format {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    /// Kept sorted by option number.
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            message_type,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(MessageType::Acknowledgement, Code::EMPTY, message_id)
    }

    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, Code::EMPTY, message_id)
    }

    pub fn with_token(mut self, token: &[u8]) -> Self {
        self.token = token.to_vec();
        self
    }

    /// Inserts after any existing options with the same number so repeated
    /// options keep their order.
    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        let index = self.options.partition_point(|option| option.number <= number);
        self.options.insert(index, CoapOption { number, value });
    }

    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |option| option.number == number)
            .map(|option| option.value.as_slice())
    }

    pub fn set_uri_path(&mut self, path: &str) {
        self.options.retain(|option| option.number != OPTION_URI_PATH);
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            self.add_option(OPTION_URI_PATH, segment.as_bytes().to_vec());
        }
    }

    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for segment in self.option_values(OPTION_URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    pub fn set_content_format(&mut self, format: ContentFormat) {
        self.options
            .retain(|option| option.number != OPTION_CONTENT_FORMAT);
        self.add_option(OPTION_CONTENT_FORMAT, encode_uint(u32::from(format.0)));
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        let value = self.option_values(OPTION_CONTENT_FORMAT).next()?;
        if value.len() > 2 {
            return None;
        }
        Some(ContentFormat(decode_uint(value) as u16))
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(CodecError::TokenTooLong(self.token.len()));
        }
        if self.code.is_empty() && self.has_content() {
            return Err(CodecError::EmptyMessageWithContent);
        }

        let mut packet = Packet::new();
        packet.header.set_version(VERSION);
        packet.header.set_type(self.message_type.into());
        packet.header.code = MessageClass::from(self.code.as_u8());
        packet.header.message_id = self.message_id;
        packet.set_token(self.token.clone());
        for option in &self.options {
            packet.add_option(WireOption::from(option.number), option.value.clone());
        }
        packet.payload = self.payload.clone();

        packet
            .to_bytes()
            .map_err(|error| CodecError::Malformed(format!("{error:?}")))
    }

    pub fn decode(input: &[u8]) -> Result<Message, CodecError> {
        if input.len() < HEADER_LEN {
            return Err(CodecError::Truncated);
        }
        let version = input[0] >> 6;
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let token_len = usize::from(input[0] & 0x0F);
        if token_len > MAX_TOKEN_LEN {
            return Err(CodecError::TokenTooLong(token_len));
        }
        if input.len() < HEADER_LEN + token_len {
            return Err(CodecError::Truncated);
        }

        let packet = Packet::from_bytes(input)
            .map_err(|error| CodecError::Malformed(format!("{error:?}")))?;

        let mut options = Vec::new();
        for (number, values) in packet.options() {
            for value in values {
                options.push(CoapOption {
                    number: *number,
                    value: value.clone(),
                });
            }
        }

        let message_type = packet.header.get_type().into();
        let message_id = packet.header.message_id;
        let token = packet.get_token().to_vec();
        let message = Message {
            message_type,
            code: Code::from_u8(u8::from(packet.header.code)),
            message_id,
            token,
            options,
            payload: packet.payload,
        };
        if message.code.is_empty() && message.has_content() {
            return Err(CodecError::EmptyMessageWithContent);
        }
        Ok(message)
    }

    fn has_content(&self) -> bool {
        !self.token.is_empty() || !self.options.is_empty() || !self.payload.is_empty()
    }
}

impl From<MessageType> for WireType {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Confirmable => WireType::Confirmable,
            MessageType::NonConfirmable => WireType::NonConfirmable,
            MessageType::Acknowledgement => WireType::Acknowledgement,
            MessageType::Reset => WireType::Reset,
        }
    }
}

impl From<WireType> for MessageType {
    fn from(value: WireType) -> Self {
        match value {
            WireType::Confirmable => MessageType::Confirmable,
            WireType::NonConfirmable => MessageType::NonConfirmable,
            WireType::Acknowledgement => MessageType::Acknowledgement,
            WireType::Reset => MessageType::Reset,
        }
    }
}

/// Minimal big-endian encoding of an unsigned option value.
fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|byte| **byte == 0).count();
    bytes[skip..].to_vec()
}

fn decode_uint(value: &[u8]) -> u32 {
    value
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte))
}
