//! Data-phase scenarios driven through the public connection surface.

use scheelite::{
    CloseCode, Connection, ConnectionState, Error, Event, ProtocolConfig, ProtocolViolation, Role,
    TextMessage,
};

fn server() -> Connection {
    Connection::new(Role::Server, Vec::new(), ProtocolConfig::default())
}

fn client() -> Connection {
    Connection::new(Role::Client, Vec::new(), ProtocolConfig::default())
}

fn seeded_client() -> Connection {
    Connection::new(
        Role::Client,
        Vec::new(),
        ProtocolConfig { mask_seed: Some(42), ..ProtocolConfig::default() },
    )
}

fn drain(conn: &mut Connection) -> Vec<Event> {
    conn.events().collect::<Result<_, _>>().expect("no protocol error expected")
}

fn expect_remote_error(conn: &mut Connection) -> scheelite::RemoteProtocolError {
    let err = conn
        .events()
        .find_map(|event| event.err())
        .expect("expected a remote protocol error");
    match err {
        Error::Remote(err) => err,
        Error::Local(err) => panic!("unexpected local error: {err}"),
    }
}

fn close_hint_code(err: &scheelite::RemoteProtocolError) -> u16 {
    match err.event_hint() {
        Some(Event::Close(close)) => close.code.into(),
        other => panic!("expected a close hint, got {other:?}"),
    }
}

// Scenario S2: a server must fail the connection on an unmasked frame.
#[test]
fn unmasked_client_frame_is_a_protocol_error() {
    let mut conn = server();
    conn.receive_data(Some(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f])).unwrap();
    let err = expect_remote_error(&mut conn);
    assert_eq!(err.violation, ProtocolViolation::UnmaskedFrameFromClient);
    assert_eq!(close_hint_code(&err), 1002);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

// Scenario S3: the masked "Hello" from RFC 6455.
#[test]
fn masked_text_frame_decodes() {
    let mut conn = server();
    conn.receive_data(Some(&[
        0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
    ]))
    .unwrap();
    assert_eq!(
        drain(&mut conn),
        vec![Event::Text(TextMessage {
            data: "Hello".into(),
            frame_finished: true,
            message_finished: true,
        })]
    );
}

// Scenario S4: fragmentation with the mask key 37 fa 21 3d on each frame.
#[test]
fn fragmented_text_message() {
    let mut conn = server();
    conn.receive_data(Some(&[0x01, 0x81, 0x37, 0xfa, 0x21, 0x3d, 0x7f])).unwrap();
    conn.receive_data(Some(&[0x80, 0x84, 0x37, 0xfa, 0x21, 0x3d, 0x52, 0x96, 0x4d, 0x52]))
        .unwrap();

    let events = drain(&mut conn);
    assert_eq!(
        events,
        vec![
            Event::Text(TextMessage {
                data: "H".into(),
                frame_finished: true,
                message_finished: false,
            }),
            Event::Text(TextMessage {
                data: "ello".into(),
                frame_finished: true,
                message_finished: true,
            }),
        ]
    );
}

// Scenario S5: ping and its canonical response.
#[test]
fn ping_response() {
    let mut conn = server();
    conn.receive_data(Some(&[0x89, 0x00])).unwrap();
    let events = drain(&mut conn);
    assert_eq!(events, vec![Event::ping(Vec::new())]);

    let bytes = conn.send(events[0].response().unwrap()).unwrap();
    assert_eq!(bytes, vec![0x8a, 0x00]);
}

#[test]
fn ping_response_echoes_payload() {
    let mut conn = server();
    conn.receive_data(Some(&[0x89, 0x83, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03])).unwrap();
    let events = drain(&mut conn);
    let bytes = conn.send(events[0].response().unwrap()).unwrap();
    assert_eq!(bytes, vec![0x8a, 0x03, 0x01, 0x02, 0x03]);
}

// Scenario S6: closing with 1005 writes an empty payload.
#[test]
fn close_without_status_sends_empty_payload() {
    let mut conn = server();
    let bytes = conn.send(Event::close(CloseCode::Status, "")).unwrap();
    assert_eq!(bytes, vec![0x88, 0x00]);
    assert_eq!(conn.state(), ConnectionState::LocalClosing);
}

// Scenario S7: the close reply mirrors the peer's code.
#[test]
fn close_reply_mirrors_code() {
    let mut conn = server();
    conn.receive_data(Some(&[0x88, 0x82, 0x00, 0x00, 0x00, 0x00, 0x03, 0xe8])).unwrap();
    let events = drain(&mut conn);
    match &events[0] {
        Event::Close(close) => {
            assert_eq!(close.code, CloseCode::Normal);
            assert_eq!(close.reason, "");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::RemoteClosing);

    let bytes = conn.send(events[0].response().unwrap()).unwrap();
    assert_eq!(bytes, vec![0x88, 0x02, 0x03, 0xe8]);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[test]
fn empty_close_payload_yields_1005() {
    let mut conn = client();
    conn.receive_data(Some(&[0x88, 0x00])).unwrap();
    match &drain(&mut conn)[0] {
        Event::Close(close) => assert_eq!(u16::from(close.code), 1005),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn invalid_close_code_on_wire_fails() {
    // 1006 must never appear on the wire.
    let mut conn = client();
    conn.receive_data(Some(&[0x88, 0x02, 0x03, 0xee])).unwrap();
    let err = expect_remote_error(&mut conn);
    assert_eq!(err.violation, ProtocolViolation::InvalidCloseCode(1006));
    assert_eq!(close_hint_code(&err), 1002);
}

// Invariant 1: encode → decode preserves every frame kind.
#[test]
fn roundtrip_through_both_roles() {
    let mut sender = seeded_client();
    let mut receiver = server();

    let outbound = vec![
        Event::text("round trip"),
        Event::binary(vec![0x00, 0x01, 0xfe, 0xff]),
        Event::ping(b"p".to_vec()),
        Event::pong(b"q".to_vec()),
        Event::close(CloseCode::Normal, "done"),
    ];
    for event in &outbound {
        let bytes = sender.send(event.clone()).unwrap();
        receiver.receive_data(Some(&bytes)).unwrap();
    }

    let received = drain(&mut receiver);
    assert_eq!(received, outbound);
}

// Invariant 4: the client mask is self-inverse, verified on the wire.
#[test]
fn client_masking_recovers_plaintext() {
    let mut conn = seeded_client();
    let bytes = conn.send(Event::text("Hello")).unwrap();

    assert_eq!(bytes[0], 0x81);
    assert_eq!(bytes[1], 0x80 | 5, "client frames carry the mask bit");
    let mask = [bytes[2], bytes[3], bytes[4], bytes[5]];
    let unmasked: Vec<u8> =
        bytes[6..].iter().enumerate().map(|(i, byte)| byte ^ mask[i & 3]).collect();
    assert_eq!(unmasked, b"Hello");
}

#[test]
fn mask_differs_per_frame() {
    let mut conn = seeded_client();
    let first = conn.send(Event::text("aaaa")).unwrap();
    let second = conn.send(Event::text("aaaa")).unwrap();
    assert_ne!(first[2..6], second[2..6]);
}

/// Collapses chunked message events so runs over different transport
/// chunkings can be compared.
#[derive(Default)]
struct Normalizer {
    out: Vec<(String, Vec<u8>)>,
    text: String,
    bytes: Vec<u8>,
}

impl Normalizer {
    fn push(&mut self, event: Event) {
        match event {
            Event::Text(msg) => {
                self.text.push_str(&msg.data);
                if msg.message_finished {
                    self.out.push(("text".into(), std::mem::take(&mut self.text).into_bytes()));
                }
            }
            Event::Bytes(msg) => {
                self.bytes.extend(msg.data);
                if msg.message_finished {
                    self.out.push(("bytes".into(), std::mem::take(&mut self.bytes)));
                }
            }
            Event::Ping(ping) => self.out.push(("ping".into(), ping.payload)),
            Event::Pong(pong) => self.out.push(("pong".into(), pong.payload)),
            Event::Close(close) => {
                self.out.push(("close".into(), close.reason.into_bytes()))
            }
            other => panic!("unexpected event: {other}"),
        }
    }
}

fn run_chunked(stream: &[u8], chunk_size: usize) -> Vec<(String, Vec<u8>)> {
    let mut conn = client();
    let mut normalizer = Normalizer::default();
    for chunk in stream.chunks(chunk_size) {
        conn.receive_data(Some(chunk)).unwrap();
        for event in conn.events() {
            normalizer.push(event.unwrap());
        }
    }
    normalizer.out
}

// Invariant 2: feeding bytes in arbitrary chunks yields the same
// assembled event stream.
#[test]
fn byte_feeding_is_associative() {
    let stream: Vec<u8> = [
        &[0x01, 0x03, b'H', b'e', b'l'][..],
        &[0x89, 0x01, 0xaa],
        &[0x80, 0x02, b'l', b'o'],
        &[0x82, 0x03, 0x01, 0x02, 0x03],
        &[0x8a, 0x00],
        &[0x88, 0x02, 0x03, 0xe8],
    ]
    .concat();

    let whole = run_chunked(&stream, stream.len());
    assert_eq!(
        whole,
        vec![
            ("ping".into(), vec![0xaa]),
            ("text".into(), b"Hello".to_vec()),
            ("bytes".into(), vec![1, 2, 3]),
            ("pong".into(), vec![]),
            ("close".into(), vec![]),
        ]
    );
    for chunk_size in [1, 2, 3, 5, 7, 11] {
        assert_eq!(run_chunked(&stream, chunk_size), whole, "chunk size {chunk_size}");
    }
}

// Invariant 5: UTF-8 survives any frame split, mid-code-point included.
#[test]
fn utf8_survives_any_frame_boundary() {
    let text = "caf\u{e9} \u{2705}";
    let bytes = text.as_bytes();

    for split in 1..bytes.len() {
        let (head, tail) = bytes.split_at(split);
        let mut stream = vec![0x01, head.len() as u8];
        stream.extend_from_slice(head);
        stream.push(0x80);
        stream.push(tail.len() as u8);
        stream.extend_from_slice(tail);

        let mut conn = client();
        conn.receive_data(Some(&stream)).unwrap();
        let mut collected = String::new();
        for event in conn.events() {
            match event.unwrap() {
                Event::Text(msg) => collected.push_str(&msg.data),
                other => panic!("unexpected event: {other}"),
            }
        }
        assert_eq!(collected, text, "split at {split}");
    }
}

#[test]
fn invalid_utf8_is_1007() {
    let mut conn = client();
    conn.receive_data(Some(&[0x81, 0x01, 0xff])).unwrap();
    let err = expect_remote_error(&mut conn);
    assert_eq!(err.violation, ProtocolViolation::InvalidUtf8);
    assert_eq!(close_hint_code(&err), 1007);
}

#[test]
fn truncated_utf8_at_message_end_is_1007() {
    let mut conn = client();
    conn.receive_data(Some(&[0x81, 0x01, 0xc3])).unwrap();
    let err = expect_remote_error(&mut conn);
    assert_eq!(err.violation, ProtocolViolation::InvalidUtf8);
}

// Invariant 6: after the peer's close, nothing but the error path remains.
#[test]
fn close_is_exactly_once() {
    let mut conn = client();
    conn.receive_data(Some(&[0x88, 0x00, 0x88, 0x00])).unwrap();
    let mut events = conn.events();
    assert!(matches!(events.next(), Some(Ok(Event::Close(_)))));
    match events.next() {
        Some(Err(Error::Remote(err))) => {
            assert_eq!(err.violation, ProtocolViolation::ReceivedAfterClosing);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(events.next().is_none());
}

#[test]
fn oversized_message_is_1009() {
    let mut conn = Connection::new(
        Role::Client,
        Vec::new(),
        ProtocolConfig { max_message_size: Some(8), ..ProtocolConfig::default() },
    );
    conn.receive_data(Some(&[0x82, 0x09, 1, 2, 3, 4, 5, 6, 7, 8, 9])).unwrap();
    let err = expect_remote_error(&mut conn);
    assert_eq!(err.violation, ProtocolViolation::MessageTooBig);
    assert_eq!(close_hint_code(&err), 1009);
}

#[test]
fn streaming_delivers_large_frames_incrementally() {
    let mut conn = client();
    // An 80-byte binary frame arriving in two transport reads.
    let mut head = vec![0x82, 80];
    head.extend(std::iter::repeat(0x5a).take(30));
    conn.receive_data(Some(&head)).unwrap();

    let first = drain(&mut conn);
    assert_eq!(first.len(), 1);
    match &first[0] {
        Event::Bytes(msg) => {
            assert_eq!(msg.data.len(), 30);
            assert!(!msg.frame_finished);
            assert!(!msg.message_finished);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    conn.receive_data(Some(&[0x5a; 50])).unwrap();
    let second = drain(&mut conn);
    assert_eq!(second.len(), 1);
    match &second[0] {
        Event::Bytes(msg) => {
            assert_eq!(msg.data.len(), 50);
            assert!(msg.frame_finished);
            assert!(msg.message_finished);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn receive_after_eof_is_a_local_error() {
    let mut conn = client();
    conn.receive_data(None).unwrap();
    match conn.receive_data(Some(&[0x81])) {
        Err(Error::Local(err)) => {
            assert_eq!(err, scheelite::LocalProtocolError::ReceiveAfterEof);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
