// Public client API.
//
// `RelayClient` owns the current connection (socket link, shared session,
// reader thread) and the application's callback sinks. Network threads
// only queue events; every callback runs inside `process_events` on the
// caller's thread, so applications never need their handlers to be
// re-entrant or thread-aware.
//
// `connect` reports every failure, including immediate ones like a
// refused socket, asynchronously through the connect-result callback.
// Callers get exactly one code path to handle failures on.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use gullwake_protocol::{ClientFrame, ConnectPayload, NetId};
use log::info;

use crate::error::{RelayError, SendError};
use crate::events::{ConnectCallback, RelayCallback, RelayEvent, SystemCallback};
use crate::session::{ConnectionState, RTT_UNKNOWN_MS, Session, lock_session};
use crate::transport::{self, TransportKind, TransportLink};

/// Tunables that outlive any single connection.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Heartbeat interval while connected, on every transport.
    pub ping_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig { ping_interval_ms: 1000 }
    }
}

/// Everything one connection attempt needs.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// TLS for the WebSocket transport; ignored by TCP and UDP.
    pub ssl: bool,
    pub passcode: String,
    /// The lobby to join or create on the relay.
    pub lobby_id: String,
    /// This client's connection id, echoed back by the relay when the
    /// handshake completes.
    pub cx_id: String,
    /// Client build version, checked by the relay.
    pub version: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            host: "127.0.0.1".to_string(),
            port: 7878,
            ssl: false,
            passcode: String::new(),
            lobby_id: String::new(),
            cx_id: String::new(),
            version: "1".to_string(),
        }
    }
}

struct Conn {
    link: Arc<TransportLink>,
    session: Arc<Mutex<Session>>,
    reader: Option<JoinHandle<()>>,
}

/// A relay connection engine driven by periodic `process_events` calls.
pub struct RelayClient {
    config: ClientConfig,
    events_tx: Sender<RelayEvent>,
    events_rx: Receiver<RelayEvent>,
    conn: Option<Conn>,
    on_connect: Option<ConnectCallback>,
    on_relay: Option<RelayCallback>,
    on_system: Option<SystemCallback>,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        RelayClient {
            config,
            events_tx,
            events_rx,
            conn: None,
            on_connect: None,
            on_relay: None,
            on_system: None,
        }
    }

    /// Open a connection and start the handshake. Always returns
    /// immediately; success or failure arrives through `on_result` on a
    /// later `process_events` call. A client already connecting or
    /// connected rejects the new attempt and keeps the old connection.
    pub fn connect<F>(&mut self, kind: TransportKind, options: ConnectOptions, on_result: F)
    where
        F: FnMut(bool, &str) + Send + 'static,
    {
        self.on_connect = Some(Box::new(on_result));
        if let Some(conn) = &self.conn {
            if lock_session(&conn.session).state() != ConnectionState::Disconnected {
                self.queue_failure(RelayError::Connect("already connected".into()));
                return;
            }
        }
        self.teardown_conn();

        let payload = match serde_json::to_vec(&ConnectPayload {
            lobby_id: options.lobby_id.clone(),
            cx_id: options.cx_id.clone(),
            passcode: options.passcode.clone(),
            version: options.version.clone(),
        }) {
            Ok(payload) => payload,
            Err(e) => {
                self.queue_failure(RelayError::Connect(format!("handshake encode failed: {e}")));
                return;
            }
        };
        let handshake = match (ClientFrame::Connect { payload }).encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.queue_failure(RelayError::Connect(format!("handshake encode failed: {e}")));
                return;
            }
        };

        info!("connecting via {kind:?} to {}:{}", options.host, options.port);
        let conn = match kind {
            TransportKind::Udp => match transport::open_udp(&options.host, options.port) {
                Ok(link) => {
                    let session = self.new_session(kind, &options, handshake.clone());
                    if !self.send_handshake(&link, &handshake) {
                        return;
                    }
                    let reader = transport::spawn_udp_reader(link.clone(), session.clone());
                    Conn { link, session, reader: Some(reader) }
                }
                Err(e) => {
                    self.queue_failure(RelayError::Connect(format!("socket open failed: {e}")));
                    return;
                }
            },
            TransportKind::Tcp => match transport::open_tcp(&options.host, options.port) {
                Ok((link, read_half)) => {
                    let session = self.new_session(kind, &options, handshake.clone());
                    if !self.send_handshake(&link, &handshake) {
                        return;
                    }
                    let reader =
                        transport::spawn_tcp_reader(link.clone(), session.clone(), read_half);
                    Conn { link, session, reader: Some(reader) }
                }
                Err(e) => {
                    self.queue_failure(RelayError::Connect(format!("socket open failed: {e}")));
                    return;
                }
            },
            TransportKind::WebSocket => {
                match transport::open_ws(&options.host, options.port, options.ssl) {
                    Ok((link, ws, outbox)) => {
                        let session = self.new_session(kind, &options, handshake.clone());
                        if !self.send_handshake(&link, &handshake) {
                            return;
                        }
                        let reader =
                            transport::spawn_ws_reader(link.clone(), session.clone(), ws, outbox);
                        Conn { link, session, reader: Some(reader) }
                    }
                    Err(e) => {
                        self.queue_failure(RelayError::Connect(format!(
                            "websocket connect failed: {e}"
                        )));
                        return;
                    }
                }
            }
        };
        self.conn = Some(conn);
    }

    /// Tear the current connection down, telling the relay first when it
    /// is established over UDP. Idempotent, and produces no callback.
    pub fn disconnect(&mut self) {
        if let Some(conn) = &self.conn {
            if let Some(notice) = lock_session(&conn.session).begin_disconnect() {
                let _ = conn.link.send(&notice);
            }
        }
        self.teardown_conn();
    }

    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| lock_session(&conn.session).is_connected())
    }

    /// Send one payload to the peers in `recipient_mask`. Only local
    /// validation errors surface here; transport failures tear the
    /// connection down and arrive through the connect-result callback.
    pub fn send_relay(
        &mut self,
        payload: &[u8],
        recipient_mask: u64,
        reliable: bool,
        ordered: bool,
        channel: u8,
    ) -> Result<(), SendError> {
        let Some(conn) = &self.conn else {
            return Err(SendError::NotConnected);
        };
        let frame = lock_session(&conn.session).prepare_relay(
            Instant::now(),
            payload,
            recipient_mask,
            reliable,
            ordered,
            channel,
        )?;
        if let Err(e) = conn.link.send(&frame) {
            lock_session(&conn.session).fail(RelayError::Io(format!("send failed: {e}")));
            conn.link.close();
        }
        Ok(())
    }

    /// The netId currently paired with a connection id, if any.
    pub fn net_id_for(&self, cx_id: &str) -> Option<NetId> {
        self.conn.as_ref().and_then(|conn| lock_session(&conn.session).net_id_for(cx_id))
    }

    /// The connection id currently paired with a netId, if any.
    pub fn cx_id_for(&self, net_id: NetId) -> Option<String> {
        self.conn.as_ref().and_then(|conn| lock_session(&conn.session).cx_id_for(net_id))
    }

    /// The session owner's connection id, once announced.
    pub fn owner_cx_id(&self) -> Option<String> {
        self.conn.as_ref().and_then(|conn| lock_session(&conn.session).owner_cx_id())
    }

    /// Last measured round-trip time in milliseconds, or `RTT_UNKNOWN_MS`.
    pub fn get_ping(&self) -> u16 {
        self.conn.as_ref().map_or(RTT_UNKNOWN_MS, |conn| lock_session(&conn.session).rtt_ms())
    }

    /// Register the sink for relayed payloads.
    pub fn set_relay_handler(&mut self, handler: impl FnMut(NetId, &[u8]) + Send + 'static) {
        self.on_relay = Some(Box::new(handler));
    }

    /// Register the sink for raw system message JSON.
    pub fn set_system_handler(&mut self, handler: impl FnMut(&str) + Send + 'static) {
        self.on_system = Some(Box::new(handler));
    }

    /// Dispatch queued events into the registered callbacks, then drive
    /// the connection's timers (handshake retry, retransmission,
    /// inactivity, heartbeat). Call this regularly, e.g. once per frame.
    pub fn process_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                RelayEvent::ConnectResult { success, detail } => {
                    if let Some(cb) = &mut self.on_connect {
                        cb(success, &detail);
                    }
                }
                RelayEvent::RelayMessage { sender, payload } => {
                    if let Some(cb) = &mut self.on_relay {
                        cb(sender, &payload);
                    }
                }
                RelayEvent::SystemMessage { json } => {
                    if let Some(cb) = &mut self.on_system {
                        cb(&json);
                    }
                }
            }
        }

        if let Some(conn) = &self.conn {
            let (sends, dead) = {
                let mut session = lock_session(&conn.session);
                let sends = session.tick(Instant::now());
                (sends, session.state() == ConnectionState::Disconnected)
            };
            for frame in &sends {
                if let Err(e) = conn.link.send(frame) {
                    lock_session(&conn.session).fail(RelayError::Io(format!("send failed: {e}")));
                    conn.link.close();
                    break;
                }
            }
            if dead {
                conn.link.close();
            }
        }
    }

    fn new_session(
        &self,
        kind: TransportKind,
        options: &ConnectOptions,
        handshake: Vec<u8>,
    ) -> Arc<Mutex<Session>> {
        Arc::new(Mutex::new(Session::new(
            kind,
            options.cx_id.clone(),
            handshake,
            Duration::from_millis(self.config.ping_interval_ms),
            self.events_tx.clone(),
            Instant::now(),
        )))
    }

    /// Put the initial CONNECT frame on the wire, reporting failure the
    /// same way as every other connect error.
    fn send_handshake(&mut self, link: &TransportLink, handshake: &[u8]) -> bool {
        match link.send(handshake) {
            Ok(()) => true,
            Err(e) => {
                link.close();
                self.queue_failure(RelayError::Connect(format!("handshake send failed: {e}")));
                false
            }
        }
    }

    fn queue_failure(&self, err: RelayError) {
        let _ = self
            .events_tx
            .send(RelayEvent::ConnectResult { success: false, detail: err.to_string() });
    }

    fn teardown_conn(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.link.close();
            if let Some(reader) = conn.reader.take() {
                let _ = reader.join();
            }
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        // Flag the reader threads down; they exit on their next poll.
        if let Some(conn) = &self.conn {
            conn.link.close();
        }
    }
}
