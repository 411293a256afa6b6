//! The data-phase WebSocket state machine.

pub mod frame;

mod message;

pub use self::frame::{FrameDecoder, FrameEncoder};

use log::*;

use self::frame::coding::{CloseCode, Control, Data, OpCode};
use self::frame::{Frame, FrameChunk};
use self::message::StringCollector;
use crate::error::{LocalProtocolError, ProtocolViolation, RemoteProtocolError, Result};
use crate::events::{BytesMessage, CloseConnection, Event, Ping, Pong, TextMessage};
use crate::extensions::{Extension, Rsv};

/// Indicates a Client or Server role of the websocket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This socket is a server
    Server,
    /// This socket is a client
    Client,
}

/// The observable state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The opening handshake is in progress.
    Connecting,
    /// The server refused the handshake and is streaming the reject body.
    Rejecting,
    /// The connection is open for messages.
    Open,
    /// A local close was sent; awaiting the peer's close.
    LocalClosing,
    /// The peer's close arrived; a local close reply is owed.
    RemoteClosing,
    /// The connection is finished.
    Closed,
}

/// The default maximum message size (64 MiB).
pub const MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// The maximum accumulated size of one inbound message; `None` removes
    /// the cap. Exceeding it fails the connection with close code 1009.
    pub max_message_size: Option<usize>,
    /// Seed for the masking-key generator. Leave `None` outside of tests.
    pub mask_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig { max_message_size: Some(MAX_MESSAGE_SIZE), mask_seed: None }
    }
}

/// A WebSocket connection past its opening handshake.
///
/// This is the pure data-phase engine: bytes in through
/// [`receive_data`](Connection::receive_data), events out through
/// [`events`](Connection::events), events in through
/// [`send`](Connection::send), bytes out as its return value. It can be
/// constructed directly with a role and pre-negotiated extensions for
/// transports whose handshake happened elsewhere, e.g. an HTTP/2 stream
/// (RFC 8441).
#[derive(Debug)]
pub struct Connection {
    role: Role,
    state: ConnectionState,
    config: ProtocolConfig,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    extensions: Vec<Box<dyn Extension>>,
    /// Receive: the data opcode of the message being assembled.
    incoming_opcode: Option<Data>,
    /// Receive: accumulated size of the message being assembled.
    incoming_size: usize,
    /// Receive: UTF-8 state of the text message being assembled.
    utf8: StringCollector,
    close_received: bool,
    failed: bool,
    /// Send: the data opcode of the message being fragmented.
    outgoing_opcode: Option<Data>,
}

impl Connection {
    /// Create an open connection with already-agreed extensions.
    pub fn new(role: Role, extensions: Vec<Box<dyn Extension>>, config: ProtocolConfig) -> Self {
        let encoder = match config.mask_seed {
            Some(seed) => FrameEncoder::seeded(role, seed),
            None => FrameEncoder::new(role),
        };
        Connection {
            role,
            state: ConnectionState::Open,
            config,
            decoder: FrameDecoder::new(role),
            encoder,
            extensions,
            incoming_opcode: None,
            incoming_size: 0,
            utf8: StringCollector::new(),
            close_received: false,
            failed: false,
            outgoing_opcode: None,
        }
    }

    /// The connection's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The connection's state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Append received bytes to the internal buffer, or record
    /// end-of-stream on `None`. Never yields events on its own.
    pub fn receive_data(&mut self, data: Option<&[u8]>) -> Result<()> {
        self.decoder.receive_bytes(data)?;
        Ok(())
    }

    /// Drain all currently-parseable events.
    ///
    /// The iterator is single-use: exhaust it before the next
    /// `receive_data`. A remote protocol violation is yielded as its final
    /// item, after which the connection is CLOSED.
    pub fn events(&mut self) -> Events<'_> {
        Events { connection: self, terminated: false }
    }

    /// Pull the next parseable event, if any.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        if self.failed {
            return Ok(None);
        }
        loop {
            let allowed = self.allowed_rsv();
            let chunk = match self.decoder.next_chunk(allowed) {
                Ok(chunk) => chunk,
                Err(violation) => return self.fail(violation),
            };
            match chunk {
                Some(chunk) => match self.handle_chunk(chunk) {
                    Ok(Some(event)) => return Ok(Some(event)),
                    Ok(None) => continue,
                    Err(violation) => return self.fail(violation),
                },
                None => {
                    if self.decoder.is_eof()
                        && !self.close_received
                        && self.state != ConnectionState::Closed
                    {
                        self.state = ConnectionState::Closed;
                        self.failed = true;
                        return Err(RemoteProtocolError::without_hint(
                            ProtocolViolation::ResetWithoutClosingHandshake,
                        )
                        .into());
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Validate `event` against the current state and serialize it.
    pub fn send(&mut self, event: Event) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        match event {
            Event::Text(msg) => {
                self.send_data(Data::Text, msg.data.into_bytes(), msg.message_finished, &mut output)?
            }
            Event::Bytes(msg) => {
                self.send_data(Data::Binary, msg.data, msg.message_finished, &mut output)?
            }
            Event::Ping(ping) => self.send_control(Control::Ping, ping.payload, &mut output)?,
            Event::Pong(pong) => self.send_control(Control::Pong, pong.payload, &mut output)?,
            Event::Close(close) => self.send_close(close, &mut output)?,
            other => return Err(LocalProtocolError::EventNotAllowed(other.name()).into()),
        }
        Ok(output)
    }

    fn allowed_rsv(&self) -> Rsv {
        self.extensions
            .iter()
            .filter(|ext| ext.enabled())
            .fold(Rsv::NONE, |acc, ext| acc.union(ext.reserved_bits()))
    }

    fn fail(&mut self, violation: ProtocolViolation) -> Result<Option<Event>> {
        self.state = ConnectionState::Closed;
        self.failed = true;
        Err(RemoteProtocolError::new(violation).into())
    }

    fn handle_chunk(&mut self, chunk: FrameChunk) -> std::result::Result<Option<Event>, ProtocolViolation> {
        if self.close_received {
            return Err(ProtocolViolation::ReceivedAfterClosing);
        }
        match chunk.header.opcode {
            OpCode::Control(ctl) => self.handle_control(ctl, chunk),
            OpCode::Data(data) => self.handle_data(data, chunk),
        }
    }

    fn handle_control(
        &mut self,
        ctl: Control,
        chunk: FrameChunk,
    ) -> std::result::Result<Option<Event>, ProtocolViolation> {
        match ctl {
            Control::Ping => Ok(Some(Event::Ping(Ping { payload: chunk.payload }))),
            Control::Pong => Ok(Some(Event::Pong(Pong { payload: chunk.payload }))),
            Control::Close => {
                let close = Frame::from_payload(chunk.header, chunk.payload).into_close()?;
                self.close_received = true;
                self.state = match self.state {
                    ConnectionState::LocalClosing => ConnectionState::Closed,
                    _ => ConnectionState::RemoteClosing,
                };
                debug!("received close frame, connection is {:?}", self.state);
                Ok(Some(Event::Close(close)))
            }
            Control::Reserved(i) => Err(ProtocolViolation::InvalidOpcode(i)),
        }
    }

    fn handle_data(
        &mut self,
        data: Data,
        chunk: FrameChunk,
    ) -> std::result::Result<Option<Event>, ProtocolViolation> {
        let fin = chunk.header.is_final;

        if chunk.chunk_start {
            match data {
                Data::Continue => {
                    if self.incoming_opcode.is_none() {
                        return Err(ProtocolViolation::UnexpectedContinuationFrame);
                    }
                }
                Data::Text | Data::Binary => {
                    if self.incoming_opcode.is_some() {
                        return Err(ProtocolViolation::ExpectedContinuationFrame);
                    }
                    self.incoming_opcode = Some(data);
                }
                Data::Reserved(i) => return Err(ProtocolViolation::InvalidOpcode(i)),
            }

            if let Some(max) = self.config.max_message_size {
                if chunk.length.saturating_add(self.incoming_size as u64) > max as u64 {
                    return Err(ProtocolViolation::MessageTooBig);
                }
            }

            // Extensions claim the RSV bits they recognize on this frame.
            let rsv = chunk.header.rsv();
            let mut claimed = Rsv::NONE;
            for ext in self.extensions.iter_mut().filter(|ext| ext.enabled()) {
                claimed = claimed
                    .union(ext.frame_inbound_header(chunk.header.opcode, rsv, fin, chunk.length)?);
            }
            if !claimed.contains(rsv) {
                return Err(ProtocolViolation::NonZeroReservedBits);
            }
        }

        let mut payload = chunk.payload;
        for ext in self.extensions.iter_mut().filter(|ext| ext.enabled()) {
            payload = ext.frame_inbound_payload_data(payload)?;
        }
        if chunk.frame_finished {
            for ext in self.extensions.iter_mut().filter(|ext| ext.enabled()) {
                payload.extend(ext.frame_inbound_complete(fin)?);
            }
        }

        self.incoming_size = self.incoming_size.saturating_add(payload.len());
        if let Some(max) = self.config.max_message_size {
            if self.incoming_size > max {
                return Err(ProtocolViolation::MessageTooBig);
            }
        }

        let message_finished = chunk.frame_finished && fin;
        let opcode =
            self.incoming_opcode.expect("Bug: data chunk without an assembling message");
        let event = match opcode {
            Data::Text => {
                let text = self.utf8.push(&payload)?;
                if message_finished {
                    self.utf8.finish()?;
                }
                if text.is_empty() && !chunk.frame_finished {
                    return Ok(None);
                }
                Event::Text(TextMessage {
                    data: text,
                    frame_finished: chunk.frame_finished,
                    message_finished,
                })
            }
            Data::Binary => {
                if payload.is_empty() && !chunk.frame_finished {
                    return Ok(None);
                }
                Event::Bytes(BytesMessage {
                    data: payload,
                    frame_finished: chunk.frame_finished,
                    message_finished,
                })
            }
            Data::Continue | Data::Reserved(_) => {
                unreachable!("Bug: assembling message with a non-data opcode")
            }
        };

        if message_finished {
            self.incoming_opcode = None;
            self.incoming_size = 0;
        }
        Ok(Some(event))
    }

    fn send_data(
        &mut self,
        variant: Data,
        payload: Vec<u8>,
        message_finished: bool,
        output: &mut Vec<u8>,
    ) -> Result<()> {
        if self.state != ConnectionState::Open {
            let name = if variant == Data::Text { "TextMessage" } else { "BytesMessage" };
            return Err(LocalProtocolError::EventNotAllowed(name).into());
        }

        let opcode = match self.outgoing_opcode {
            Some(current) => {
                if current != variant {
                    return Err(LocalProtocolError::FragmentTypeMismatch.into());
                }
                Data::Continue
            }
            None => variant,
        };

        // Outbound frames run the extension chain in reverse order.
        let mut rsv = Rsv::NONE;
        let mut data = payload;
        for ext in self.extensions.iter_mut().rev().filter(|ext| ext.enabled()) {
            let (new_rsv, new_data) = ext
                .frame_outbound(OpCode::Data(opcode), rsv, data, message_finished)
                .map_err(|e| LocalProtocolError::Extension(e.to_string()))?;
            rsv = new_rsv;
            data = new_data;
        }

        let mut frame = Frame::message(data, OpCode::Data(opcode), message_finished);
        frame.header_mut().set_rsv(rsv);
        self.encoder.encode(frame, output);
        self.outgoing_opcode = if message_finished { None } else { Some(variant) };
        Ok(())
    }

    fn send_control(&mut self, ctl: Control, payload: Vec<u8>, output: &mut Vec<u8>) -> Result<()> {
        let allowed = match ctl {
            Control::Ping => self.state == ConnectionState::Open,
            // A pong stays legal after a local close was sent.
            Control::Pong => {
                matches!(self.state, ConnectionState::Open | ConnectionState::LocalClosing)
            }
            _ => false,
        };
        if !allowed {
            let name = if ctl == Control::Ping { "Ping" } else { "Pong" };
            return Err(LocalProtocolError::EventNotAllowed(name).into());
        }
        if payload.len() > 125 {
            return Err(LocalProtocolError::ControlPayloadTooBig.into());
        }
        let frame = match ctl {
            Control::Ping => Frame::ping(payload),
            _ => Frame::pong(payload),
        };
        self.encoder.encode(frame, output);
        Ok(())
    }

    fn send_close(&mut self, close: CloseConnection, output: &mut Vec<u8>) -> Result<()> {
        let next = match self.state {
            ConnectionState::Open => ConnectionState::LocalClosing,
            ConnectionState::RemoteClosing => ConnectionState::Closed,
            _ => return Err(LocalProtocolError::EventNotAllowed("CloseConnection").into()),
        };
        if !(close.code.is_allowed() || close.code == CloseCode::Status) {
            return Err(LocalProtocolError::InvalidCloseCode(close.code.into()).into());
        }
        if close.reason.len() > 123 {
            return Err(LocalProtocolError::ControlPayloadTooBig.into());
        }
        self.encoder.encode(Frame::close(&close), output);
        self.state = next;
        debug!("sent close frame, connection is {:?}", self.state);
        Ok(())
    }
}

/// The draining iterator returned by [`Connection::events`].
#[derive(Debug)]
pub struct Events<'a> {
    connection: &'a mut Connection,
    terminated: bool,
}

impl Iterator for Events<'_> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.terminated {
            return None;
        }
        match self.connection.next_event() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.terminated = true;
                None
            }
            Err(err) => {
                self.terminated = true;
                Some(Err(err))
            }
        }
    }
}
