//! Minimal CoAP client layer: message codec, confirmable request/response
//! exchange and retransmission timing.

mod client;
pub mod message;
mod retransmit;

pub use client::{CoapClient, Response};
pub use message::{CodecError, Code, ContentFormat, Message, MessageType};
pub use retransmit::RetransmitTimer;
