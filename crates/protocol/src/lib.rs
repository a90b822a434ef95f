//! Protocol definitions for transaction manager communication
//!
//! Typed wrappers around the transport's generic `Message`. The message kind
//! travels in the `type` header and the payload is CBOR encoded in the body.
//! The set of messages is closed: everything the transaction manager consumes
//! is an [`Inbound`] variant.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tmx_transport::Message;

pub mod messages;
pub mod responses;

pub use messages::{
    ExitReason, Inbound, InvolvedRequest, Phase, ProcessExit, ResourceReady, ResourceReply,
    TransactionRequest,
};
pub use responses::{RequestKind, ResourceRequest, TransactionReply};

/// Header carrying the message kind
pub const TYPE_HEADER: &str = "type";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedType {
        expected: &'static str,
        actual: String,
    },

    #[error("Failed to decode {kind}: {reason}")]
    Decode { kind: String, reason: String },

    #[error("Failed to encode {kind}: {reason}")]
    Encode { kind: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

pub(crate) fn encode<T: Serialize>(kind: &'static str, value: &T) -> Result<Message> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(value, &mut body).map_err(|e| ProtocolError::Encode {
        kind,
        reason: e.to_string(),
    })?;
    Ok(Message::with_body(body).with_header(TYPE_HEADER, kind))
}

pub(crate) fn decode<T: DeserializeOwned>(message: &Message) -> Result<T> {
    ciborium::de::from_reader(message.body.as_slice()).map_err(|e| ProtocolError::Decode {
        kind: message.get_header(TYPE_HEADER).unwrap_or("?").to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn message_type(message: &Message) -> Result<&str> {
    message
        .get_header(TYPE_HEADER)
        .ok_or(ProtocolError::MissingHeader(TYPE_HEADER))
}

pub(crate) fn expect_type(message: &Message, expected: &'static str) -> Result<()> {
    let actual = message_type(message)?;
    if actual != expected {
        return Err(ProtocolError::UnexpectedType {
            expected,
            actual: actual.to_string(),
        });
    }
    Ok(())
}
