// Integration tests for the WebSocket transport against a scripted stub.
//
// Unlike the UDP and TCP stubs these run on their own thread, because
// `connect` blocks until the stub answers the HTTP upgrade. Stub-side
// assertions surface through the join at the end of each test.

use std::net::{TcpListener, TcpStream};
use std::thread;

use gullwake_protocol::{ClientFrame, NetId, PacketId, RelayHeader, ServerFrame};
use gullwake_relay::{ClientConfig, RelayClient, TransportKind};
use tungstenite::{Message, WebSocket};

mod common;
use common::{STEP_TIMEOUT, attach_recorders, options, pump_until, result_recorder};

/// Read binary messages until one decodes as a client frame.
fn read_ws_frame(ws: &mut WebSocket<TcpStream>) -> ClientFrame {
    loop {
        match ws.read().unwrap() {
            Message::Binary(data) => {
                return ClientFrame::decode(&data).expect("undecodable client frame");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected message {other:?}"),
        }
    }
}

fn send_ws_frame(ws: &mut WebSocket<TcpStream>, frame: &ServerFrame) {
    ws.send(Message::binary(frame.encode().unwrap())).unwrap();
}

fn own_connect_message() -> ServerFrame {
    ServerFrame::Rsmg {
        seq: 0,
        body: br#"{"op":"CONNECT","cxId":"cx-tester","netId":0,"ownerCxId":"cx-owner"}"#.to_vec(),
    }
}

/// Accept the upgrade and answer the relay handshake.
fn accept_session(listener: &TcpListener) -> WebSocket<TcpStream> {
    let (stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(STEP_TIMEOUT)).unwrap();
    let mut ws = tungstenite::accept(stream).unwrap();
    let frame = read_ws_frame(&mut ws);
    assert!(matches!(frame, ClientFrame::Connect { .. }), "got {frame:?}");
    send_ws_frame(&mut ws, &own_connect_message());
    ws
}

#[test]
fn handshake_and_relay_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let stub = thread::spawn(move || {
        let mut ws = accept_session(&listener);
        send_ws_frame(
            &mut ws,
            &ServerFrame::Relay {
                header: RelayHeader::with_sender(true, true, 0, PacketId::ZERO, 0b1, NetId(5)),
                payload: b"from-peer".to_vec(),
            },
        );

        // The client's half of the exchange, heartbeats skipped.
        let (header, payload) = loop {
            match read_ws_frame(&mut ws) {
                ClientFrame::Relay { header, payload } => break (header, payload),
                ClientFrame::Ping { .. } => {}
                other => panic!("expected RELAY, got {other:?}"),
            }
        };
        assert_eq!(payload, b"to-peers");
        assert!(!header.reliable && !header.ordered);
        assert_eq!(header.channel, 2);
        assert_eq!(header.packet_id, PacketId::ZERO);
        assert_eq!(header.recipient_mask(), 0b101);
    });

    let mut client = RelayClient::new(ClientConfig::default());
    let record = attach_recorders(&mut client);
    client.connect(TransportKind::WebSocket, options(port), result_recorder(&record));

    assert!(pump_until(&mut client, STEP_TIMEOUT, |_| {
        !record.lock().unwrap().results.is_empty()
    }));
    assert_eq!(record.lock().unwrap().results[0], (true, String::new()));
    assert!(client.is_connected());

    assert!(pump_until(&mut client, STEP_TIMEOUT, |_| {
        record.lock().unwrap().relays.len() == 1
    }));
    assert_eq!(record.lock().unwrap().relays[0], (NetId(5), b"from-peer".to_vec()));

    client.send_relay(b"to-peers", 0b101, false, false, 2).unwrap();
    stub.join().unwrap();
    client.disconnect();
}

#[test]
fn server_close_surfaces_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let stub = thread::spawn(move || {
        let mut ws = accept_session(&listener);
        ws.close(None).unwrap();
        // Drain until the close handshake completes so the client reads
        // an orderly close rather than a connection reset.
        while ws.read().is_ok() {}
    });

    let mut client = RelayClient::new(ClientConfig::default());
    let record = attach_recorders(&mut client);
    client.connect(TransportKind::WebSocket, options(port), result_recorder(&record));

    assert!(pump_until(&mut client, STEP_TIMEOUT, |_| {
        record.lock().unwrap().results.iter().any(|(success, _)| !success)
    }));
    assert!(!client.is_connected());
    {
        let record = record.lock().unwrap();
        let (_, detail) = record.results.last().unwrap();
        assert!(detail.contains("connection closed by relay"), "got {detail}");
    }
    stub.join().unwrap();
}
