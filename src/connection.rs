//! The connection façade.
//!
//! [`WSConnection`] couples the opening [`Handshake`] with the data-phase
//! [`Connection`] behind the three-operation surface of the engine:
//! `receive_data` for bytes in, `events` for protocol events out, `send`
//! for events in and bytes out. When the handshake completes, the façade
//! swaps to the data phase in place, carrying negotiated extensions and
//! any frame bytes that arrived alongside the handshake head.

use std::mem;

use log::*;

use crate::error::{LocalProtocolError, Result};
use crate::events::Event;
use crate::extensions::Extension;
use crate::handshake::Handshake;
use crate::protocol::{Connection, ConnectionState, ProtocolConfig, Role};

/// A WebSocket connection, from the first handshake byte onward.
#[derive(Debug)]
pub struct WSConnection {
    phase: Phase,
}

#[derive(Debug)]
enum Phase {
    Handshaking(Handshake),
    Open(Connection),
    Closed,
}

impl WSConnection {
    /// Create a connection with no extensions and default configuration.
    pub fn new(role: Role) -> Self {
        WSConnection::with_config(role, Vec::new(), ProtocolConfig::default())
    }

    /// Create a connection with the given extensions and configuration.
    pub fn with_config(
        role: Role,
        extensions: Vec<Box<dyn Extension>>,
        config: ProtocolConfig,
    ) -> Self {
        WSConnection { phase: Phase::Handshaking(Handshake::new(role, extensions, config)) }
    }

    /// The connection's state.
    pub fn state(&self) -> ConnectionState {
        match &self.phase {
            Phase::Handshaking(handshake) => handshake.state(),
            Phase::Open(connection) => connection.state(),
            Phase::Closed => ConnectionState::Closed,
        }
    }

    /// Append received bytes to the internal buffer, or record
    /// end-of-stream on `None`. Never yields events on its own.
    pub fn receive_data(&mut self, data: Option<&[u8]>) -> Result<()> {
        match &mut self.phase {
            Phase::Handshaking(handshake) => handshake.receive_data(data),
            Phase::Open(connection) => connection.receive_data(data),
            Phase::Closed => Err(LocalProtocolError::ReceiveAfterEof.into()),
        }
    }

    /// Drain all currently-parseable events.
    ///
    /// The iterator is single-use: exhaust it before the next
    /// `receive_data`. A remote protocol violation is yielded as its
    /// final item, after which the connection is CLOSED.
    pub fn events(&mut self) -> Events<'_> {
        Events { connection: self, terminated: false }
    }

    /// Validate `event` against the current state and serialize it.
    pub fn send(&mut self, event: Event) -> Result<Vec<u8>> {
        match &mut self.phase {
            Phase::Handshaking(handshake) => {
                let bytes = handshake.send(event)?;
                let done = handshake.is_done();
                let closed = handshake.state() == ConnectionState::Closed;
                if done {
                    self.promote();
                } else if closed {
                    self.phase = Phase::Closed;
                }
                Ok(bytes)
            }
            Phase::Open(connection) => connection.send(event),
            Phase::Closed => Err(LocalProtocolError::EventNotAllowed(event.name()).into()),
        }
    }

    fn next_event(&mut self) -> Result<Option<Event>> {
        match &mut self.phase {
            Phase::Handshaking(handshake) => {
                let event = handshake.next_event()?;
                let done = handshake.is_done();
                match event {
                    Some(event) => {
                        if done {
                            self.promote();
                        }
                        Ok(Some(event))
                    }
                    None => Ok(None),
                }
            }
            Phase::Open(connection) => connection.next_event(),
            Phase::Closed => Ok(None),
        }
    }

    /// Swap the completed handshake for the data-phase connection.
    fn promote(&mut self) {
        if let Phase::Handshaking(handshake) = mem::replace(&mut self.phase, Phase::Closed) {
            if let Some(connection) = handshake.into_connection() {
                debug!("handshake complete, switching to the data phase");
                self.phase = Phase::Open(connection);
            }
        }
    }
}

/// The draining iterator returned by [`WSConnection::events`].
#[derive(Debug)]
pub struct Events<'a> {
    connection: &'a mut WSConnection,
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
