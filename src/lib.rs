//! A sans-I/O implementation of the WebSocket protocol.
//!
//! This crate is a pure state machine for RFC 6455 (WebSocket) and
//! RFC 7692 (per-message compression): bytes from the transport go in
//! through `receive_data`, protocol events come out of `events()`, and
//! `send` turns events into the bytes to write. It never touches a
//! socket, spawns a thread, or arms a timer; the caller owns all I/O,
//! which makes the engine equally at home under blocking, non-blocking,
//! or async transports.
//!
//! [`WSConnection`] is the usual entry point and drives the HTTP opening
//! handshake for either role before switching to the data phase.
//! [`Connection`] is the data phase alone, for transports whose handshake
//! happened elsewhere, such as an HTTP/2 stream (RFC 8441).
//!
//! ```
//! use scheelite::{Event, Role, WSConnection};
//!
//! let mut server = WSConnection::new(Role::Server);
//! server.receive_data(Some(
//!     b"GET /chat HTTP/1.1\r\n\
//!       Host: server.example.com\r\n\
//!       Upgrade: websocket\r\n\
//!       Connection: Upgrade\r\n\
//!       Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
//!       Sec-WebSocket-Version: 13\r\n\r\n",
//! ))?;
//!
//! let request = match server.events().next() {
//!     Some(Ok(Event::Request(request))) => request,
//!     other => panic!("expected a request, got {other:?}"),
//! };
//! assert_eq!(request.host, "server.example.com");
//! assert_eq!(request.target, "/chat");
//!
//! let reply = server.send(Event::AcceptConnection(Default::default()))?;
//! assert!(reply.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
//! # Ok::<(), scheelite::Error>(())
//! ```
#![deny(
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub mod error;
pub mod events;
pub mod extensions;
pub mod protocol;

#[cfg(feature = "handshake")]
pub mod connection;
#[cfg(feature = "handshake")]
pub mod handshake;

pub use crate::error::{
    Error, LocalProtocolError, ProtocolViolation, RemoteProtocolError, Result,
};
pub use crate::events::{
    AcceptConnection, BytesMessage, CloseConnection, Event, Ping, Pong, RejectConnection,
    RejectData, Request, TextMessage,
};
pub use crate::protocol::frame::coding::CloseCode;
pub use crate::protocol::{Connection, ConnectionState, ProtocolConfig, Role};

#[cfg(feature = "handshake")]
pub use crate::connection::WSConnection;
#[cfg(feature = "handshake")]
pub use crate::handshake::{derive_accept_key, Handshake};
