//! WebSocket handshake control.
//!
//! [`Handshake`] drives the HTTP-level opening negotiation as a pure state
//! machine: inbound bytes are parsed with `httparse` (the collaborating
//! HTTP head parser), protocol events go out through
//! [`next_event`](Handshake::next_event), and `send` returns the raw
//! HTTP bytes to write. Once the handshake is done,
//! [`into_connection`](Handshake::into_connection) carries the negotiated
//! extensions and any already-buffered frame bytes over to the data phase.

pub(crate) mod headers;

mod client;
mod server;

use bytes::{Buf, BytesMut};
use data_encoding::BASE64;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use httparse::Status;
use log::*;
use sha1::{Digest, Sha1};

use crate::error::{LocalProtocolError, ProtocolViolation, RemoteProtocolError, Result};
use crate::events::{AcceptConnection, Event, RejectConnection, RejectData, Request};
use crate::extensions::Extension;
use crate::protocol::{Connection, ConnectionState, ProtocolConfig, Role};

/// How many HTTP headers do we support during parsing?
const MAX_HEADERS: usize = 124;

/// Turns a `Sec-WebSocket-Key` into a `Sec-WebSocket-Accept`.
pub fn derive_accept_key(key: &[u8]) -> String {
    // ... the key is concatenated with the string
    // "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" (RFC 6455)
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WS_GUID);
    BASE64.encode(&sha1.finalize())
}

/// Generate a random key for the `Sec-WebSocket-Key` header.
pub fn generate_key() -> String {
    // a base64-encoded (see Section 4 of [RFC4648]) value that,
    // when decoded, is 16 bytes in length (RFC 6455)
    let r: [u8; 16] = rand::random();
    BASE64.encode(&r)
}

/// A parsed request head, as the collaborating HTTP parser delivers it.
#[derive(Debug)]
pub(crate) struct RequestHead {
    method: String,
    target: String,
    headers: HeaderMap,
}

/// A parsed response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
}

trait TryParse: Sized {
    /// Parse a head from the buffer, returning the bytes consumed along
    /// with it, or `None` when the head is still incomplete.
    fn try_parse(data: &[u8]) -> std::result::Result<Option<(usize, Self)>, RemoteProtocolError>;
}

impl TryParse for RequestHead {
    fn try_parse(data: &[u8]) -> std::result::Result<Option<(usize, Self)>, RemoteProtocolError> {
        let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut hbuffer);
        match req.parse(data) {
            Ok(Status::Partial) => Ok(None),
            Ok(Status::Complete(size)) => {
                if req.version.expect("Bug: no HTTP version") < /*1.*/1 {
                    return Err(RemoteProtocolError::with_reject(
                        ProtocolViolation::WrongHttpVersion,
                        400,
                    ));
                }
                let head = RequestHead {
                    method: req.method.expect("Bug: no method in header").to_owned(),
                    target: req.path.expect("Bug: no path in header").to_owned(),
                    headers: header_map(req.headers)?,
                };
                Ok(Some((size, head)))
            }
            Err(err) => {
                Err(RemoteProtocolError::with_reject(ProtocolViolation::BadHttpHead(err), 400))
            }
        }
    }
}

impl TryParse for ResponseHead {
    fn try_parse(data: &[u8]) -> std::result::Result<Option<(usize, Self)>, RemoteProtocolError> {
        let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut hbuffer);
        match resp.parse(data) {
            Ok(Status::Partial) => Ok(None),
            Ok(Status::Complete(size)) => {
                if resp.version.expect("Bug: no HTTP version") < /*1.*/1 {
                    return Err(RemoteProtocolError::without_hint(
                        ProtocolViolation::WrongHttpVersion,
                    ));
                }
                let status = StatusCode::from_u16(resp.code.expect("Bug: no HTTP status code"))
                    .map_err(|_| {
                        RemoteProtocolError::without_hint(ProtocolViolation::MalformedHttpHeader)
                    })?;
                Ok(Some((size, ResponseHead { status, headers: header_map(resp.headers)? })))
            }
            Err(err) => {
                Err(RemoteProtocolError::without_hint(ProtocolViolation::BadHttpHead(err)))
            }
        }
    }
}

fn header_map(
    raw: &[httparse::Header<'_>],
) -> std::result::Result<HeaderMap, RemoteProtocolError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| {
            RemoteProtocolError::without_hint(ProtocolViolation::MalformedHttpHeader)
        })?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| {
            RemoteProtocolError::without_hint(ProtocolViolation::MalformedHttpHeader)
        })?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    ClientStart,
    ClientWaitingResponse,
    ClientReceivingRejectBody { remaining: Option<u64> },
    ServerWaitingRequest,
    ServerReceivedRequest,
    ServerSentRejectHead,
    ServerSentRejectBody,
    Done,
    Closed,
}

/// The sans-I/O opening-handshake machine.
#[derive(Debug)]
pub struct Handshake {
    role: Role,
    state: HandshakeState,
    config: ProtocolConfig,
    extensions: Vec<Box<dyn Extension>>,
    buffer: BytesMut,
    eof: bool,
    /// Client: the Sec-WebSocket-Key that went out.
    nonce: Option<String>,
    /// Subprotocols on the table, ours (client) or the peer's (server).
    offered_subprotocols: Vec<String>,
    /// Server: the peer's key, kept for the accept computation.
    peer_key: Option<String>,
    /// Server: the peer's extension offers.
    offered_extensions: Vec<String>,
}

impl Handshake {
    /// Create a handshake machine for the given role.
    pub fn new(role: Role, extensions: Vec<Box<dyn Extension>>, config: ProtocolConfig) -> Self {
        let state = match role {
            Role::Client => HandshakeState::ClientStart,
            Role::Server => HandshakeState::ServerWaitingRequest,
        };
        Handshake {
            role,
            state,
            config,
            extensions,
            buffer: BytesMut::new(),
            eof: false,
            nonce: None,
            offered_subprotocols: Vec::new(),
            peer_key: None,
            offered_extensions: Vec::new(),
        }
    }

    /// The connection-level state this handshake is in.
    pub fn state(&self) -> ConnectionState {
        match self.state {
            HandshakeState::ClientStart
            | HandshakeState::ClientWaitingResponse
            | HandshakeState::ClientReceivingRejectBody { .. }
            | HandshakeState::ServerWaitingRequest
            | HandshakeState::ServerReceivedRequest => ConnectionState::Connecting,
            HandshakeState::ServerSentRejectHead | HandshakeState::ServerSentRejectBody => {
                ConnectionState::Rejecting
            }
            HandshakeState::Done => ConnectionState::Open,
            HandshakeState::Closed => ConnectionState::Closed,
        }
    }

    /// Whether the handshake succeeded.
    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Append received bytes, or record end-of-stream on `None`.
    pub fn receive_data(&mut self, data: Option<&[u8]>) -> Result<()> {
        match data {
            Some(_) if self.eof => Err(LocalProtocolError::ReceiveAfterEof.into()),
            Some(data) => {
                self.buffer.extend_from_slice(data);
                Ok(())
            }
            None => {
                self.eof = true;
                Ok(())
            }
        }
    }

    /// Pull the next handshake event, if one is parseable.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        match self.state {
            HandshakeState::ClientWaitingResponse => self.client_head(),
            HandshakeState::ClientReceivingRejectBody { .. } => self.client_reject_body(),
            HandshakeState::ServerWaitingRequest => self.server_head(),
            _ => Ok(None),
        }
    }

    /// Validate `event` against the handshake state and serialize it.
    pub fn send(&mut self, event: Event) -> Result<Vec<u8>> {
        match event {
            Event::Request(request) => self.send_request(request),
            Event::AcceptConnection(accept) => self.send_accept(accept),
            Event::RejectConnection(reject) => self.send_reject(reject),
            Event::RejectData(data) => self.send_reject_data(data),
            other => Err(LocalProtocolError::EventNotAllowed(other.name()).into()),
        }
    }

    /// Once DONE, convert into the data-phase connection, carrying over
    /// the negotiated extensions and any bytes past the handshake head.
    pub fn into_connection(self) -> Option<Connection> {
        if self.state != HandshakeState::Done {
            return None;
        }
        let mut connection = Connection::new(self.role, self.extensions, self.config);
        if !self.buffer.is_empty() {
            connection
                .receive_data(Some(&self.buffer))
                .expect("Bug: fresh connection refused data");
        }
        if self.eof {
            connection.receive_data(None).expect("Bug: fresh connection refused EOF");
        }
        Some(connection)
    }

    fn send_request(&mut self, request: Request) -> Result<Vec<u8>> {
        if self.role != Role::Client || self.state != HandshakeState::ClientStart {
            return Err(LocalProtocolError::EventNotAllowed("Request").into());
        }
        let key = generate_key();
        let bytes = client::encode_request(&request, &key, &self.extensions);
        self.nonce = Some(key);
        self.offered_subprotocols = request.subprotocols;
        self.state = HandshakeState::ClientWaitingResponse;
        debug!("client handshake initiated for {}", request.target);
        Ok(bytes)
    }

    fn send_accept(&mut self, accept: AcceptConnection) -> Result<Vec<u8>> {
        if self.state != HandshakeState::ServerReceivedRequest {
            return Err(LocalProtocolError::EventNotAllowed("AcceptConnection").into());
        }
        if let Some(protocol) = &accept.subprotocol {
            if !self.offered_subprotocols.contains(protocol) {
                return Err(LocalProtocolError::UnofferedSubprotocol(protocol.clone()).into());
            }
        }
        let key = self.peer_key.clone().expect("Bug: accepting without a request");
        let bytes =
            server::encode_accept(&key, &accept, &mut self.extensions, &self.offered_extensions);
        self.state = HandshakeState::Done;
        debug!("server handshake done");
        Ok(bytes)
    }

    fn send_reject(&mut self, reject: RejectConnection) -> Result<Vec<u8>> {
        if self.state != HandshakeState::ServerReceivedRequest {
            return Err(LocalProtocolError::EventNotAllowed("RejectConnection").into());
        }
        let bytes = server::encode_reject(&reject)?;
        self.state = if reject.has_body {
            HandshakeState::ServerSentRejectHead
        } else {
            HandshakeState::Closed
        };
        debug!("handshake rejected with status {}", reject.status_code);
        Ok(bytes)
    }

    fn send_reject_data(&mut self, data: RejectData) -> Result<Vec<u8>> {
        match self.state {
            HandshakeState::ServerSentRejectHead | HandshakeState::ServerSentRejectBody => {}
            _ => return Err(LocalProtocolError::EventNotAllowed("RejectData").into()),
        }
        self.state = if data.body_finished {
            HandshakeState::Closed
        } else {
            HandshakeState::ServerSentRejectBody
        };
        Ok(data.data)
    }

    fn client_head(&mut self) -> Result<Option<Event>> {
        let parsed = match ResponseHead::try_parse(&self.buffer) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.state = HandshakeState::Closed;
                return Err(err.into());
            }
        };
        let (consumed, head) = match parsed {
            Some(parsed) => parsed,
            None => return self.check_handshake_eof(),
        };
        self.buffer.advance(consumed);

        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            let nonce = self.nonce.as_deref().expect("Bug: awaiting a response without a key");
            let accept_key = derive_accept_key(nonce.as_bytes());
            match client::verify_response(
                head,
                &accept_key,
                &self.offered_subprotocols,
                &mut self.extensions,
            ) {
                Ok(accept) => {
                    debug!("client handshake done");
                    self.state = HandshakeState::Done;
                    Ok(Some(Event::AcceptConnection(accept)))
                }
                Err(err) => {
                    self.state = HandshakeState::Closed;
                    Err(err.into())
                }
            }
        } else {
            // Anything else, another 1xx included, passes through as a
            // rejection for the caller to inspect.
            let (reject, remaining) = match client::reject_from_head(&head) {
                Ok(reject) => reject,
                Err(err) => {
                    self.state = HandshakeState::Closed;
                    return Err(err.into());
                }
            };
            debug!("handshake rejected with status {}", reject.status_code);
            self.state = if reject.has_body {
                HandshakeState::ClientReceivingRejectBody { remaining }
            } else {
                HandshakeState::Closed
            };
            Ok(Some(Event::RejectConnection(reject)))
        }
    }

    fn client_reject_body(&mut self) -> Result<Option<Event>> {
        let remaining = match self.state {
            HandshakeState::ClientReceivingRejectBody { remaining } => remaining,
            _ => unreachable!("Bug: not receiving a reject body"),
        };

        let available = match remaining {
            Some(remaining) => (self.buffer.len() as u64).min(remaining) as usize,
            None => self.buffer.len(),
        };
        if available == 0 && !self.eof {
            return Ok(None);
        }

        let data = self.buffer.split_to(available).to_vec();
        let remaining = remaining.map(|remaining| remaining - available as u64);
        let body_finished =
            matches!(remaining, Some(0)) || (self.eof && self.buffer.is_empty());

        self.state = if body_finished {
            HandshakeState::Closed
        } else {
            HandshakeState::ClientReceivingRejectBody { remaining }
        };
        if data.is_empty() && !body_finished {
            return Ok(None);
        }
        Ok(Some(Event::RejectData(RejectData { data, body_finished })))
    }

    fn server_head(&mut self) -> Result<Option<Event>> {
        let parsed = match RequestHead::try_parse(&self.buffer) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.state = HandshakeState::Closed;
                return Err(err.into());
            }
        };
        let (consumed, head) = match parsed {
            Some(parsed) => parsed,
            None => return self.check_handshake_eof(),
        };
        self.buffer.advance(consumed);

        match server::validate_request(head) {
            Ok(validated) => {
                debug!("received upgrade request for {}", validated.event.target);
                self.peer_key = Some(validated.key);
                self.offered_subprotocols = validated.event.subprotocols.clone();
                self.offered_extensions = validated.event.extensions.clone();
                self.state = HandshakeState::ServerReceivedRequest;
                Ok(Some(Event::Request(validated.event)))
            }
            Err(err) => {
                self.state = HandshakeState::Closed;
                Err(err.into())
            }
        }
    }

    fn check_handshake_eof(&mut self) -> Result<Option<Event>> {
        if self.eof {
            self.state = HandshakeState::Closed;
            Err(RemoteProtocolError::without_hint(ProtocolViolation::HandshakeIncomplete).into())
        } else {
            Ok(None)
        }
    }
}
