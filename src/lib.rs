//! A WebSocket (RFC 6455) protocol engine.
//!
//! The engine is split into a transport-independent core and a tokio driver:
//!
//! - [`frame`] turns bytes into [`Frame`]s and back.
//! - [`extension`] runs negotiated per-connection frame transforms, and
//!   [`deflate`] is the one that ships with the crate.
//! - [`handshake`] negotiates the HTTP upgrade on either side.
//! - [`reassembler`] joins continuation frames into [`Message`]s.
//! - [`connection`] owns the OPEN/CLOSING/CLOSED lifecycle and dispatches
//!   events to an [`Endpoint`].
//! - [`socket`] drives a [`Connection`] over any `AsyncRead + AsyncWrite`.

pub mod close;
pub mod config;
pub mod connection;
pub mod deflate;
pub mod endpoint;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod reassembler;
pub mod socket;

pub use close::{CloseCode, CloseReason};
pub use config::{ClientConfig, Config, ServerConfig, DEFAULT_FRAGMENT_SIZE};
pub use connection::{Connection, Session, State};
pub use deflate::{DeflateConfig, PerMessageDeflate};
pub use endpoint::{Endpoint, EndpointError};
pub use extension::{
    Extension, ExtensionChain, ExtensionError, ExtensionFactory, ExtensionOffer,
    ExtensionParameter,
};
pub use frame::{Frame, FrameBuilder, FrameCodec, Opcode};
pub use handshake::{
    compute_accept, ClientHandshake, HandshakeRequest, HandshakeResponse, Headers, Negotiated,
    Negotiator, SessionPermit, Upgrade,
};
pub use reassembler::{Assembled, MessageReassembler};
pub use socket::WebSocket;

use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O: {0}")]
    TokioIo(#[from] tokio::io::Error),
    #[error("Could not get random data")]
    GetRandom(getrandom::Error),
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Extension {name} failed: {source}")]
    Extension {
        name: String,
        source: ExtensionError,
    },
    #[error("Endpoint callback failed: {0}")]
    Endpoint(EndpointError),
    #[error("Tried to send on a websocket that is not open: {0:?}")]
    NotOpen(State),
    #[error("A fragmented message is already being sent")]
    FragmentInProgress,
    #[error("Outbound queue is full: {pending} bytes pending, limit is {limit}")]
    WriteQueueFull { pending: usize, limit: usize },
}

impl Error {
    /// The close code this error puts on the wire, if it closes the connection
    /// with a close frame at all.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Protocol(error) => Some(error.close_code()),
            Error::Extension { .. } | Error::WriteQueueFull { .. } | Error::GetRandom(_) => {
                Some(CloseCode::Internal)
            }
            Error::TokioIo(_)
            | Error::Handshake(_)
            | Error::Endpoint(_)
            | Error::NotOpen(_)
            | Error::FragmentInProgress => None,
        }
    }
}

impl From<getrandom::Error> for Error {
    fn from(error: getrandom::Error) -> Self {
        Error::GetRandom(error)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Not a websocket upgrade request")]
    NotWebSocket,
    #[error("Got an unexpected HTTP request: {0}")]
    InvalidRequest(String),
    #[error("Got an unexpected HTTP response: {0}")]
    UnexpectedResponse(String),
    #[error("Got an unexpected HTTP status in response: {0}")]
    UnexpectedStatus(u16),
    #[error("Missing or invalid header: {0}")]
    MissingOrInvalidHeader(String),
    #[error("Unsupported Sec-WebSocket-Version: {0}")]
    UnsupportedVersion(String),
    #[error("Sec-WebSocket-Accept does not match the key that was sent")]
    InvalidAccept,
    #[error("No subprotocol offered by the client is supported")]
    NoMatchingSubprotocol,
    #[error("Server selected a subprotocol that was not offered: {0}")]
    UnexpectedSubprotocol(String),
    #[error("Server accepted an extension that was not offered: {0}")]
    UnexpectedExtension(String),
    #[error("Extension {name} rejected the handshake: {message}")]
    Extension { name: String, message: String },
    #[error("Incorrect scheme, not one of \"ws\" or \"wss\": {0}")]
    IncorrectScheme(String),
    #[error("URL does not have a host")]
    NoHostInUrl,
    #[error("Handshake was longer than {0} bytes")]
    TooLong(usize),
    #[error("Invalid UTF-8 in handshake")]
    InvalidUtf8,
    #[error("Handshake timed out")]
    Timeout,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Client sent an unmasked frame")]
    UnmaskedFrame,
    #[error("Server sent a masked frame")]
    MaskedFrame,
    #[error("Invalid payload length")]
    InvalidPayloadLen,
    #[error("Frame of {len} bytes is larger than the limit of {max}")]
    FrameTooLarge { len: u64, max: usize },
    #[error("Got a fragmented control frame")]
    FragmentedControl,
    #[error("Got control frame larger than 125 bytes: {0}")]
    TooLargeControl(usize),
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),
    #[error("RSV bits were set")]
    RsvSet,
    #[error("Got a continuation frame with no message in progress")]
    UnexpectedContinuation,
    #[error("Expected a continuation frame, got {0:?}")]
    ExpectedContinuation(Opcode),
    #[error("Message of {size} bytes is larger than the limit of {max}")]
    MessageTooBig { size: usize, max: usize },
    #[error("Invalid UTF-8")]
    InvalidUtf8,
    #[error("Close frame payload must be empty or at least 2 bytes")]
    InvalidClosePayload,
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),
    #[error("Close code {0} may not be sent by a client")]
    IllegalCloseCode(u16),
}

impl ProtocolError {
    pub fn close_code(&self) -> CloseCode {
        match self {
            ProtocolError::InvalidUtf8 => CloseCode::InvalidPayload,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::MessageTooBig { .. } => {
                CloseCode::TooBig
            }
            _ => CloseCode::Protocol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    pub fn opcode(self) -> Opcode {
        match self {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
        }
    }
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Text(_) => MessageKind::Text,
            Message::Binary(_) => MessageKind::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_payload(self) -> Bytes {
        match self {
            Message::Text(text) => Bytes::from(text),
            Message::Binary(data) => data,
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.into())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data.into())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

/// One piece of a message, delivered when partial delivery is enabled.
///
/// Text fragments always hold whole codepoints; a codepoint split across
/// frames is carried over to the next fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text { text: String, last: bool },
    Binary { data: Bytes, last: bool },
}

impl Fragment {
    pub fn is_last(&self) -> bool {
        match self {
            Fragment::Text { last, .. } | Fragment::Binary { last, .. } => *last,
        }
    }
}
