//! Protocol events.
//!
//! Everything the engine tells the caller, and everything the caller asks
//! the engine to serialize, is one of these values. Handshake events
//! (`Request` through `RejectData`) only appear while the connection is
//! being established; the rest belong to the data phase.

use std::fmt;

use crate::protocol::frame::coding::CloseCode;

/// An event yielded by `events()` or handed to `send()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The HTTP upgrade request opening the handshake.
    Request(Request),
    /// The handshake succeeded; the connection is open.
    AcceptConnection(AcceptConnection),
    /// The handshake was refused with a plain HTTP response.
    RejectConnection(RejectConnection),
    /// A chunk of the body of a rejection response.
    RejectData(RejectData),
    /// A text message, or a fragment of one.
    Text(TextMessage),
    /// A binary message, or a fragment of one.
    Bytes(BytesMessage),
    /// A ping control frame.
    Ping(Ping),
    /// A pong control frame.
    Pong(Pong),
    /// A close control frame.
    Close(CloseConnection),
}

impl Event {
    /// A complete text message.
    pub fn text(data: impl Into<String>) -> Event {
        Event::Text(TextMessage { data: data.into(), frame_finished: true, message_finished: true })
    }

    /// A complete binary message.
    pub fn binary(data: impl Into<Vec<u8>>) -> Event {
        Event::Bytes(BytesMessage {
            data: data.into(),
            frame_finished: true,
            message_finished: true,
        })
    }

    /// A ping carrying `payload`.
    pub fn ping(payload: impl Into<Vec<u8>>) -> Event {
        Event::Ping(Ping { payload: payload.into() })
    }

    /// A pong carrying `payload`.
    pub fn pong(payload: impl Into<Vec<u8>>) -> Event {
        Event::Pong(Pong { payload: payload.into() })
    }

    /// A close frame with `code` and `reason`.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Event {
        Event::Close(CloseConnection { code, reason: reason.into() })
    }

    /// The canonical reply, for events that have one.
    pub fn response(&self) -> Option<Event> {
        match self {
            Event::Ping(ping) => Some(Event::Pong(ping.response())),
            Event::Close(close) => Some(Event::Close(close.response())),
            _ => None,
        }
    }

    /// The event's name, as used in error reports.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Event::Request(_) => "Request",
            Event::AcceptConnection(_) => "AcceptConnection",
            Event::RejectConnection(_) => "RejectConnection",
            Event::RejectData(_) => "RejectData",
            Event::Text(_) => "TextMessage",
            Event::Bytes(_) => "BytesMessage",
            Event::Ping(_) => "Ping",
            Event::Pong(_) => "Pong",
            Event::Close(_) => "CloseConnection",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The opening handshake request.
///
/// Sent by a client caller to start the handshake; yielded by a server
/// connection once the peer's request head has been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Value of the `Host` header.
    pub host: String,
    /// Request target, opaque percent-encoded bytes per RFC 3986.
    pub target: String,
    /// Subprotocols offered via `Sec-WebSocket-Protocol`.
    pub subprotocols: Vec<String>,
    /// Offered `Sec-WebSocket-Extensions` values. Carries the peer's offers
    /// on the server receive path; on the client send path the engine
    /// derives the header from the installed extensions and this field is
    /// ignored.
    pub extensions: Vec<String>,
    /// Any further headers.
    pub extra_headers: Vec<(String, String)>,
}

impl Request {
    /// A request for `target` on `host` with no subprotocols or extras.
    pub fn new(host: impl Into<String>, target: impl Into<String>) -> Request {
        Request {
            host: host.into(),
            target: target.into(),
            subprotocols: Vec::new(),
            extensions: Vec::new(),
            extra_headers: Vec::new(),
        }
    }
}

/// A successful handshake.
///
/// Sent by a server caller to accept a pending [`Request`]; yielded by a
/// client connection when the 101 response verified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptConnection {
    /// The agreed subprotocol, if any.
    pub subprotocol: Option<String>,
    /// The agreed `Sec-WebSocket-Extensions` values.
    pub extensions: Vec<String>,
    /// Any further headers.
    pub extra_headers: Vec<(String, String)>,
}

/// A refused handshake: the head of a plain HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectConnection {
    /// HTTP status code of the rejection.
    pub status_code: u16,
    /// Response headers, in order.
    pub headers: Vec<(String, String)>,
    /// Whether body bytes follow as [`RejectData`] events.
    pub has_body: bool,
}

/// A chunk of a rejection response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectData {
    /// Body bytes.
    pub data: Vec<u8>,
    /// True on the final chunk.
    pub body_finished: bool,
}

/// A text message or fragment thereof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    /// The decoded text. Always valid UTF-8; a fragment splits only on
    /// code point boundaries even when the wire frames split mid-sequence.
    pub data: String,
    /// True when this chunk ends a wire frame.
    pub frame_finished: bool,
    /// True when this chunk ends the message.
    pub message_finished: bool,
}

/// A binary message or fragment thereof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesMessage {
    /// The payload bytes.
    pub data: Vec<u8>,
    /// True when this chunk ends a wire frame.
    pub frame_finished: bool,
    /// True when this chunk ends the message.
    pub message_finished: bool,
}

/// A ping control frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ping {
    /// Application payload, at most 125 bytes.
    pub payload: Vec<u8>,
}

impl Ping {
    /// The pong answering this ping, echoing its payload.
    pub fn response(&self) -> Pong {
        Pong { payload: self.payload.clone() }
    }
}

/// A pong control frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pong {
    /// Application payload, at most 125 bytes.
    pub payload: Vec<u8>,
}

/// A close control frame.
///
/// Received with code [`CloseCode::Status`] (1005) when the peer sent an
/// empty close payload; sending code 1005 writes an empty payload in turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseConnection {
    /// The close code.
    pub code: CloseCode,
    /// The close reason text.
    pub reason: String,
}

impl CloseConnection {
    /// The close frame answering this one, mirroring code and reason.
    pub fn response(&self) -> CloseConnection {
        CloseConnection { code: self.code, reason: self.reason.clone() }
    }
}

impl From<Request> for Event {
    fn from(event: Request) -> Event {
        Event::Request(event)
    }
}

impl From<AcceptConnection> for Event {
    fn from(event: AcceptConnection) -> Event {
        Event::AcceptConnection(event)
    }
}

impl From<RejectConnection> for Event {
    fn from(event: RejectConnection) -> Event {
        Event::RejectConnection(event)
    }
}

impl From<RejectData> for Event {
    fn from(event: RejectData) -> Event {
        Event::RejectData(event)
    }
}

impl From<TextMessage> for Event {
    fn from(event: TextMessage) -> Event {
        Event::Text(event)
    }
}

impl From<BytesMessage> for Event {
    fn from(event: BytesMessage) -> Event {
        Event::Bytes(event)
    }
}

impl From<Ping> for Event {
    fn from(event: Ping) -> Event {
        Event::Ping(event)
    }
}

impl From<Pong> for Event {
    fn from(event: Pong) -> Event {
        Event::Pong(event)
    }
}

impl From<CloseConnection> for Event {
    fn from(event: CloseConnection) -> Event {
        Event::Close(event)
    }
}
