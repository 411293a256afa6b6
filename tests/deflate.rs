//! Per-message DEFLATE, negotiated and driven end-to-end.

use scheelite::extensions::deflate::{DeflateConfig, PerMessageDeflate};
use scheelite::extensions::Extension;
use scheelite::{
    BytesMessage, CloseCode, Connection, Error, Event, ProtocolConfig, ProtocolViolation, Role,
};

/// Negotiates a client/server extension pair by running the real
/// offer → accept → finalize exchange, then installs them on data-phase
/// connections the way a separately-handshaken transport would.
fn connected_pair(client_config: DeflateConfig, server_config: DeflateConfig) -> (Connection, Connection) {
    let mut client_ext = PerMessageDeflate::new(client_config);
    let mut server_ext = PerMessageDeflate::new(server_config);

    let offer = client_ext.offer().expect("deflate always offers");
    let response = server_ext.accept(&offer).expect("offer should be acceptable");
    client_ext.finalize(&response).unwrap();
    assert!(client_ext.enabled() && server_ext.enabled());

    let client =
        Connection::new(Role::Client, vec![Box::new(client_ext)], ProtocolConfig::default());
    let server =
        Connection::new(Role::Server, vec![Box::new(server_ext)], ProtocolConfig::default());
    (client, server)
}

fn relay(from: &mut Connection, to: &mut Connection, event: Event) -> Vec<Event> {
    let bytes = from.send(event).unwrap();
    to.receive_data(Some(&bytes)).unwrap();
    to.events().collect::<Result<_, _>>().unwrap()
}

fn assemble_bytes(events: &[Event]) -> Vec<u8> {
    let mut out = Vec::new();
    for event in events {
        match event {
            Event::Bytes(msg) => out.extend(msg.data.clone()),
            other => panic!("unexpected event: {other}"),
        }
    }
    out
}

// Invariant 7: any message survives a compressed round trip.
#[test]
fn compressed_roundtrip_both_directions() {
    let (mut client, mut server) = connected_pair(DeflateConfig::default(), DeflateConfig::default());

    let events = relay(&mut client, &mut server, Event::text("compress me, please"));
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::Text(msg) => {
            assert_eq!(msg.data, "compress me, please");
            assert!(msg.message_finished);
        }
        other => panic!("unexpected event: {other}"),
    }

    let payload: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
    let events = relay(&mut server, &mut client, Event::binary(payload.clone()));
    assert_eq!(assemble_bytes(&events), payload);
}

#[test]
fn empty_message_roundtrip() {
    let (mut client, mut server) = connected_pair(DeflateConfig::default(), DeflateConfig::default());
    let events = relay(&mut client, &mut server, Event::text(""));
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::Text(msg) => {
            assert_eq!(msg.data, "");
            assert!(msg.message_finished);
        }
        other => panic!("unexpected event: {other}"),
    }
}

#[test]
fn rsv1_rides_on_the_first_frame_only() {
    let (mut client, mut server) = connected_pair(DeflateConfig::default(), DeflateConfig::default());

    let first = client
        .send(Event::Bytes(BytesMessage {
            data: b"frag one ".to_vec(),
            frame_finished: true,
            message_finished: false,
        }))
        .unwrap();
    assert_eq!(first[0] & 0xC0, 0x40, "first fragment sets RSV1, not FIN");

    let second = client
        .send(Event::Bytes(BytesMessage {
            data: b"frag two".to_vec(),
            frame_finished: true,
            message_finished: true,
        }))
        .unwrap();
    assert_eq!(second[0] & 0xF0, 0x80, "final fragment sets FIN and clears RSV1");

    server.receive_data(Some(&first)).unwrap();
    server.receive_data(Some(&second)).unwrap();
    let events: Vec<Event> = server.events().collect::<Result<_, _>>().unwrap();
    assert_eq!(assemble_bytes(&events), b"frag one frag two".to_vec());
}

#[test]
fn context_takeover_carries_across_messages() {
    let (mut client, mut server) = connected_pair(DeflateConfig::default(), DeflateConfig::default());
    let payload = "a window into the past, a window into the past";
    for _ in 0..3 {
        let events = relay(&mut client, &mut server, Event::text(payload));
        match &events[0] {
            Event::Text(msg) => assert_eq!(msg.data, payload),
            other => panic!("unexpected event: {other}"),
        }
    }
}

#[test]
fn no_context_takeover_roundtrip() {
    let config = DeflateConfig {
        server_no_context_takeover: true,
        client_no_context_takeover: true,
        ..DeflateConfig::default()
    };
    let (mut client, mut server) = connected_pair(config, DeflateConfig::default());
    for _ in 0..3 {
        let events = relay(&mut client, &mut server, Event::text("reset between messages"));
        match &events[0] {
            Event::Text(msg) => assert_eq!(msg.data, "reset between messages"),
            other => panic!("unexpected event: {other}"),
        }
        let events = relay(&mut server, &mut client, Event::text("in both directions"));
        match &events[0] {
            Event::Text(msg) => assert_eq!(msg.data, "in both directions"),
            other => panic!("unexpected event: {other}"),
        }
    }
}

#[test]
fn server_may_decline_the_takeover_request() {
    // The offer asks for server_no_context_takeover; a server is free to
    // decline by not echoing the parameter, and the handshake still
    // succeeds with context takeover in effect.
    let mut client_ext = PerMessageDeflate::new(DeflateConfig {
        server_no_context_takeover: true,
        ..DeflateConfig::default()
    });
    let offer = client_ext.offer().unwrap();
    assert!(offer.contains("server_no_context_takeover"));

    let mut server_ext = PerMessageDeflate::default();
    let response = server_ext.accept("permessage-deflate; client_max_window_bits=15").unwrap();
    assert!(!response.contains("server_no_context_takeover"));
    client_ext.finalize(&response).unwrap();
    assert!(client_ext.enabled());

    let mut client =
        Connection::new(Role::Client, vec![Box::new(client_ext)], ProtocolConfig::default());
    let mut server =
        Connection::new(Role::Server, vec![Box::new(server_ext)], ProtocolConfig::default());
    for _ in 0..3 {
        let events = relay(&mut client, &mut server, Event::text("context kept"));
        match &events[0] {
            Event::Text(msg) => assert_eq!(msg.data, "context kept"),
            other => panic!("unexpected event: {other}"),
        }
        let events = relay(&mut server, &mut client, Event::text("and kept back"));
        match &events[0] {
            Event::Text(msg) => assert_eq!(msg.data, "and kept back"),
            other => panic!("unexpected event: {other}"),
        }
    }
}

#[test]
fn reduced_window_negotiation_roundtrip() {
    let client_config = DeflateConfig {
        client_max_window_bits: 10,
        server_max_window_bits: 11,
        ..DeflateConfig::default()
    };
    let (mut client, mut server) = connected_pair(client_config, DeflateConfig::default());
    let payload: Vec<u8> = (0u8..64).cycle().take(8192).collect();
    let events = relay(&mut client, &mut server, Event::binary(payload.clone()));
    assert_eq!(assemble_bytes(&events), payload);
    let events = relay(&mut server, &mut client, Event::binary(payload.clone()));
    assert_eq!(assemble_bytes(&events), payload);
}

#[test]
fn undecompressable_payload_is_1007() {
    let (_, mut server) = connected_pair(DeflateConfig::default(), DeflateConfig::default());

    // RSV1 set, zero mask, garbage that is not a DEFLATE stream.
    server
        .receive_data(Some(&[0xC2, 0x84, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff]))
        .unwrap();
    let err = server.events().find_map(|event| event.err()).expect("expected an error");
    match err {
        Error::Remote(err) => {
            assert!(matches!(err.violation, ProtocolViolation::InvalidCompressedData(_)));
            match err.event_hint() {
                Some(Event::Close(close)) => assert_eq!(close.code, CloseCode::Invalid),
                other => panic!("unexpected hint: {other:?}"),
            }
        }
        Error::Local(err) => panic!("unexpected local error: {err}"),
    }
}

#[test]
fn uncompressed_frames_still_pass_when_negotiated() {
    let (_, mut server) = connected_pair(DeflateConfig::default(), DeflateConfig::default());
    // A frame without RSV1 skips the decompressor entirely.
    server
        .receive_data(Some(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]))
        .unwrap();
    let events: Vec<Event> = server.events().collect::<Result<_, _>>().unwrap();
    match &events[0] {
        Event::Text(msg) => assert_eq!(msg.data, "Hello"),
        other => panic!("unexpected event: {other}"),
    }
}

#[cfg(feature = "handshake")]
mod negotiated_over_http {
    use super::*;
    use scheelite::{AcceptConnection, ConnectionState, Request, WSConnection};

    #[test]
    fn deflate_negotiates_through_the_handshake() {
        let mut client = WSConnection::with_config(
            Role::Client,
            vec![Box::new(PerMessageDeflate::default())],
            ProtocolConfig::default(),
        );
        let mut server = WSConnection::with_config(
            Role::Server,
            vec![Box::new(PerMessageDeflate::default())],
            ProtocolConfig::default(),
        );

        let request_bytes =
            client.send(Event::Request(Request::new("example.com", "/"))).unwrap();
        let head = String::from_utf8(request_bytes.clone()).unwrap();
        assert!(head.contains("Sec-WebSocket-Extensions: permessage-deflate"));

        server.receive_data(Some(&request_bytes)).unwrap();
        let request = match server.events().next() {
            Some(Ok(Event::Request(request))) => request,
            other => panic!("unexpected event: {other:?}"),
        };
        assert!(request.extensions.iter().any(|ext| ext.starts_with("permessage-deflate")));

        let reply =
            server.send(Event::AcceptConnection(AcceptConnection::default())).unwrap();
        client.receive_data(Some(&reply)).unwrap();
        let accept = match client.events().next() {
            Some(Ok(Event::AcceptConnection(accept))) => accept,
            other => panic!("unexpected event: {other:?}"),
        };
        assert!(accept.extensions.iter().any(|ext| ext.starts_with("permessage-deflate")));
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(server.state(), ConnectionState::Open);

        // The negotiated compressors now shape the data phase.
        let bytes = client.send(Event::text("deflated over http")).unwrap();
        assert_eq!(bytes[0] & 0x40, 0x40, "RSV1 set on the compressed frame");
        server.receive_data(Some(&bytes)).unwrap();
        match server.events().next() {
            Some(Ok(Event::Text(msg))) => assert_eq!(msg.data, "deflated over http"),
            other => panic!("unexpected event: {other:?}"),
        }

        let bytes = server.send(Event::text("and back")).unwrap();
        client.receive_data(Some(&bytes)).unwrap();
        match client.events().next() {
            Some(Ok(Event::Text(msg))) => assert_eq!(msg.data, "and back"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
