//! Error handling.
//!
//! Failures split into two kinds mirroring the two sides of the API:
//! [`LocalProtocolError`] for caller misuse (raised synchronously from
//! `send` and `receive_data`) and [`RemoteProtocolError`] for peer
//! violations (raised from `events()`). A remote error carries an
//! [`event_hint`](RemoteProtocolError::event_hint) that the caller should
//! serialize and write before dropping the transport, when one applies.

use thiserror::Error;

use crate::events::{CloseConnection, Event, RejectConnection};
use crate::protocol::frame::coding::CloseCode;

/// Result type of all library calls.
pub type Result<T> = std::result::Result<T, Error>;

/// Any failure the protocol engine can report.
#[derive(Debug, PartialEq, Error)]
pub enum Error {
    /// The local caller misused the API.
    #[error(transparent)]
    Local(#[from] LocalProtocolError),
    /// The remote peer violated the protocol.
    #[error(transparent)]
    Remote(#[from] RemoteProtocolError),
}

/// The caller attempted something illegal in the current state, or handed
/// the engine a malformed event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalProtocolError {
    /// The event may not be sent in the current connection state.
    #[error("a {0} event may not be sent in the current state")]
    EventNotAllowed(&'static str),
    /// Control frames carry at most 125 payload bytes.
    #[error("control frame payload must be 125 bytes or less")]
    ControlPayloadTooBig,
    /// The close code is reserved and may not appear on the wire.
    #[error("close code {0} may not be sent")]
    InvalidCloseCode(u16),
    /// Message fragments must keep the data type of their first frame.
    #[error("continuation fragments must keep the message's data type")]
    FragmentTypeMismatch,
    /// The server caller accepted with a subprotocol the client never offered.
    #[error("subprotocol {0:?} was not offered by the client")]
    UnofferedSubprotocol(String),
    /// `receive_data` was called again after end-of-stream was signalled.
    #[error("received data after end-of-stream")]
    ReceiveAfterEof,
    /// An event field does not satisfy its documented constraints.
    #[error("malformed event field: {0}")]
    MalformedEvent(&'static str),
    /// An outbound extension transform failed.
    #[error("extension failure: {0}")]
    Extension(String),
}

/// The remote peer violated the protocol.
///
/// After yielding one of these the connection is CLOSED; the only useful
/// actions left are writing the [`event_hint`](Self::event_hint) bytes (if
/// any) and dropping the transport.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("remote protocol violation: {violation}")]
pub struct RemoteProtocolError {
    /// The specific rule the peer broke.
    pub violation: ProtocolViolation,
    hint: Option<Event>,
}

impl RemoteProtocolError {
    /// A violation whose reply is the canonical close frame for its code.
    pub(crate) fn new(violation: ProtocolViolation) -> Self {
        let hint = violation.close_code().map(|code| {
            Event::Close(CloseConnection { code, reason: violation.to_string() })
        });
        RemoteProtocolError { violation, hint }
    }

    /// A violation with nothing useful left to send (the peer is gone).
    pub(crate) fn without_hint(violation: ProtocolViolation) -> Self {
        RemoteProtocolError { violation, hint: None }
    }

    /// A violation answered by a specific event, e.g. the 426 reject for a
    /// version mismatch.
    pub(crate) fn with_hint(violation: ProtocolViolation, hint: Event) -> Self {
        RemoteProtocolError { violation, hint: Some(hint) }
    }

    /// Server-side handshake violation, answered with a plain HTTP reject.
    pub(crate) fn with_reject(violation: ProtocolViolation, status_code: u16) -> Self {
        let hint = Event::RejectConnection(RejectConnection {
            status_code,
            headers: Vec::new(),
            has_body: false,
        });
        Self::with_hint(violation, hint)
    }

    /// The event the caller should send in reply, when one applies.
    ///
    /// Usually a [`CloseConnection`] carrying the appropriate close code; a
    /// [`RejectConnection`] for server handshake failures; `None` when the
    /// peer already tore the connection down.
    pub fn event_hint(&self) -> Option<&Event> {
        self.hint.as_ref()
    }
}

/// The specific protocol rule a [`RemoteProtocolError`] reports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolViolation {
    /// Use of the wrong HTTP method (the WebSocket protocol requires GET).
    #[error("wrong HTTP method, only GET is allowed")]
    WrongHttpMethod,
    /// Wrong HTTP version (the WebSocket protocol requires 1.1 or higher).
    #[error("HTTP version must be 1.1 or higher")]
    WrongHttpVersion,
    /// Missing `Host` header.
    #[error("missing \"Host\" header")]
    MissingHostHeader,
    /// Missing `Connection: Upgrade` header.
    #[error("missing \"Connection: Upgrade\" header")]
    MissingConnectionUpgradeHeader,
    /// Missing `Upgrade: websocket` header.
    #[error("missing \"Upgrade: websocket\" header")]
    MissingUpgradeWebSocketHeader,
    /// Missing `Sec-WebSocket-Version` header.
    #[error("missing \"Sec-WebSocket-Version: 13\" header")]
    MissingSecWebSocketVersionHeader,
    /// The peer speaks a WebSocket version other than 13.
    #[error("unsupported \"Sec-WebSocket-Version\"")]
    UnsupportedSecWebSocketVersion,
    /// `Sec-WebSocket-Key` is missing or does not decode to 16 bytes.
    #[error("missing or malformed \"Sec-WebSocket-Key\" header")]
    InvalidSecWebSocketKey,
    /// The `Sec-WebSocket-Accept` header is missing or carries the wrong key.
    #[error("key mismatch in \"Sec-WebSocket-Accept\" header")]
    SecWebSocketAcceptKeyMismatch,
    /// The server selected a subprotocol the client never offered.
    #[error("server selected subprotocol {0:?} that was not offered")]
    UnofferedSubprotocol(String),
    /// The server selected an extension the client never offered.
    #[error("server selected extension {0:?} that was not offered")]
    UnofferedExtension(String),
    /// Extension parameter negotiation failed.
    #[error("extension negotiation failed: {0}")]
    ExtensionNegotiation(String),
    /// A header value could not be interpreted.
    #[error("malformed header in HTTP head")]
    MalformedHttpHeader,
    /// The HTTP head itself could not be parsed.
    #[cfg(feature = "handshake")]
    #[error("malformed HTTP head: {0}")]
    BadHttpHead(httparse::Error),
    /// The stream ended while the handshake was still in progress.
    #[error("handshake not finished")]
    HandshakeIncomplete,
    /// Reserved bits are set without an extension claiming them.
    #[error("reserved bits are non-zero")]
    NonZeroReservedBits,
    /// The server must close the connection on an unmasked frame.
    #[error("received an unmasked frame from the client")]
    UnmaskedFrameFromClient,
    /// The client must close the connection on a masked frame.
    #[error("received a masked frame from the server")]
    MaskedFrameFromServer,
    /// Control frames must not be fragmented.
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    /// Control frames must have a payload of 125 bytes or less.
    #[error("control frame too big")]
    ControlFrameTooBig,
    /// Encountered a reserved opcode.
    #[error("encountered invalid opcode: {0}")]
    InvalidOpcode(u8),
    /// The high bit of a 64-bit payload length is set.
    #[error("frame payload length exceeds 63 bits")]
    InvalidFrameLength,
    /// Received a continuation frame with nothing to continue.
    #[error("continuation frame but nothing to continue")]
    UnexpectedContinuationFrame,
    /// Received a new data frame while a message is unfinished.
    #[error("new data frame while a message is unfinished")]
    ExpectedContinuationFrame,
    /// The payload of a close frame is invalid.
    #[error("invalid close sequence")]
    InvalidCloseSequence,
    /// The close code may not appear on the wire.
    #[error("close code {0} is not allowed")]
    InvalidCloseCode(u16),
    /// The remote sent frames after its close frame.
    #[error("the remote sent data after its close frame")]
    ReceivedAfterClosing,
    /// The stream ended without a closing handshake.
    #[error("connection reset without a closing handshake")]
    ResetWithoutClosingHandshake,
    /// A text message carries invalid UTF-8.
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,
    /// Compressed payload could not be decompressed.
    #[error("invalid compressed data: {0}")]
    InvalidCompressedData(String),
    /// The message exceeds the configured size limit.
    #[error("message exceeds the configured size limit")]
    MessageTooBig,
    /// An extension rejected the frame on policy grounds.
    #[error("extension policy rejection: {0}")]
    PolicyViolation(String),
    /// An extension found a protocol violation in the frame layout.
    #[error("extension protocol violation: {0}")]
    ExtensionViolation(String),
}

impl ProtocolViolation {
    /// The close code a peer should receive for this violation, if a close
    /// frame is still worth sending.
    pub fn close_code(&self) -> Option<CloseCode> {
        match *self {
            ProtocolViolation::InvalidUtf8 | ProtocolViolation::InvalidCompressedData(_) => {
                Some(CloseCode::Invalid)
            }
            ProtocolViolation::MessageTooBig => Some(CloseCode::Size),
            ProtocolViolation::PolicyViolation(_) => Some(CloseCode::Policy),
            ProtocolViolation::ResetWithoutClosingHandshake => None,
            _ => Some(CloseCode::Protocol),
        }
    }
}
