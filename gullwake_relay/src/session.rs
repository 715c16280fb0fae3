// Connection state machine, shared between the application thread and the
// transport reader thread behind a mutex.
//
// The session never touches a socket. `handle_frame` and `tick` return the
// frames the caller must put on the wire, and everything the application
// should hear about goes out through the event channel. That keeps the
// whole engine drivable from tests with fabricated clocks and byte
// buffers.
//
// Locking rule: callers take the session lock, call one method, release,
// then perform the returned sends. No I/O and no application callbacks
// ever run under the lock.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use gullwake_protocol::{
    AckKey, CHANNEL_COUNT, ClientFrame, MAX_PLAYERS, MAX_RELAY_PAYLOAD, NetId, RelayHeader,
    ServerFrame, StreamKey, SystemMessage,
};
use log::{debug, info, trace, warn};

use crate::error::{RelayError, SendError};
use crate::events::RelayEvent;
use crate::reliability::{
    Delivery, InboundOrdering, OutboundReliability, RsmgChannel, RsmgDelivery,
};
use crate::transport::TransportKind;

/// UDP connections drop after this long without any inbound traffic.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_millis(10_000);

/// How often the CONNECT handshake is repeated over UDP until the relay
/// confirms it.
const HANDSHAKE_RETRY: Duration = Duration::from_millis(500);

/// Round-trip time reported before any measurement exists; also the
/// ceiling a measurement is clamped to.
pub const RTT_UNKNOWN_MS: u16 = 999;

/// Lock a shared session, recovering the guard if a panicking thread
/// poisoned it.
pub(crate) fn lock_session(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection lifecycle. Failures from any state land back in
/// `Disconnected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Bidirectional cxId/netId table plus the session owner. Mutated only by
/// system message delivery; read by application queries.
#[derive(Debug, Default)]
struct IdentityTable {
    by_cx: HashMap<String, NetId>,
    by_net: HashMap<NetId, String>,
    owner_cx: Option<String>,
}

impl IdentityTable {
    /// Install a pairing, evicting any stale entry on either side so the
    /// table stays one-to-one. The invalid sentinel just removes.
    fn upsert(&mut self, cx_id: &str, net_id: NetId) {
        self.remove_cx(cx_id);
        if net_id.is_valid() {
            if let Some(old_cx) = self.by_net.remove(&net_id) {
                self.by_cx.remove(&old_cx);
            }
            self.by_cx.insert(cx_id.to_string(), net_id);
            self.by_net.insert(net_id, cx_id.to_string());
        }
    }

    fn remove_cx(&mut self, cx_id: &str) {
        if let Some(net_id) = self.by_cx.remove(cx_id) {
            self.by_net.remove(&net_id);
        }
    }
}

/// Heartbeat bookkeeping.
#[derive(Debug)]
struct PingState {
    last_sent_at: Option<Instant>,
    rtt_ms: u16,
}

impl Default for PingState {
    fn default() -> Self {
        PingState { last_sent_at: None, rtt_ms: RTT_UNKNOWN_MS }
    }
}

/// Encode a frame whose size is statically within bounds.
fn encode_fixed(frame: &ClientFrame) -> Vec<u8> {
    frame.encode().unwrap_or_default()
}

/// One connection's worth of engine state.
#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    kind: TransportKind,
    own_cx_id: String,
    identity: IdentityTable,
    outbound: OutboundReliability,
    inbound: InboundOrdering,
    rsmg: RsmgChannel,
    ping: PingState,
    ping_interval: Duration,
    /// Cached CONNECT frame, repeated over UDP until confirmed.
    handshake: Vec<u8>,
    last_handshake_at: Instant,
    last_recv_at: Instant,
    events: Sender<RelayEvent>,
}

impl Session {
    /// A session starts in `Connecting`; the caller has already put the
    /// initial handshake frame on the wire at `now`.
    pub fn new(
        kind: TransportKind,
        own_cx_id: String,
        handshake: Vec<u8>,
        ping_interval: Duration,
        events: Sender<RelayEvent>,
        now: Instant,
    ) -> Self {
        Session {
            state: ConnectionState::Connecting,
            kind,
            own_cx_id,
            identity: IdentityTable::default(),
            outbound: OutboundReliability::default(),
            inbound: InboundOrdering::default(),
            rsmg: RsmgChannel::default(),
            ping: PingState::default(),
            ping_interval,
            handshake,
            last_handshake_at: now,
            last_recv_at: now,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn net_id_for(&self, cx_id: &str) -> Option<NetId> {
        self.identity.by_cx.get(cx_id).copied()
    }

    pub fn cx_id_for(&self, net_id: NetId) -> Option<String> {
        self.identity.by_net.get(&net_id).cloned()
    }

    pub fn owner_cx_id(&self) -> Option<String> {
        self.identity.owner_cx.clone()
    }

    /// Last measured round-trip time, or `RTT_UNKNOWN_MS`.
    pub fn rtt_ms(&self) -> u16 {
        self.ping.rtt_ms
    }

    /// Single entry point for one complete inbound frame from the
    /// transport. Returns frames to send back. Fatal conditions tear the
    /// session down in place and queue the failure event.
    pub fn handle_frame(&mut self, now: Instant, bytes: &[u8]) -> Vec<Vec<u8>> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        self.last_recv_at = now;
        let frame = match ServerFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(RelayError::from(e));
                return Vec::new();
            }
        };
        match frame {
            ServerFrame::Rsmg { seq, body } => self.handle_rsmg(seq, body),
            ServerFrame::Disconnect => {
                self.fail(RelayError::ServerClosed);
                Vec::new()
            }
            ServerFrame::Relay { header, payload } => self.handle_relay(&header, payload),
            ServerFrame::Ack { header } => {
                self.handle_ack(&header);
                Vec::new()
            }
            ServerFrame::Pong { .. } => {
                self.handle_pong(now);
                Vec::new()
            }
        }
    }

    /// Drive timers: handshake retry, retransmissions, inactivity and the
    /// heartbeat. Called from the application's periodic drain.
    pub fn tick(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut sends = Vec::new();
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting => {
                if self.kind == TransportKind::Udp && !self.udp_timed_out(now) {
                    let since = now.duration_since(self.last_handshake_at);
                    if since >= HANDSHAKE_RETRY {
                        debug!("re-sending CONNECT handshake");
                        self.last_handshake_at = now;
                        sends.push(self.handshake.clone());
                    }
                }
            }
            ConnectionState::Connected => {
                if self.kind == TransportKind::Udp {
                    if self.udp_timed_out(now) {
                        return sends;
                    }
                    match self.outbound.sweep(now) {
                        Ok(due) => sends.extend(due),
                        Err(age) => {
                            self.fail(RelayError::Timeout(format!(
                                "no ack after {} ms",
                                age.as_millis()
                            )));
                            return sends;
                        }
                    }
                }
                if self.ping_due(now) {
                    self.ping.last_sent_at = Some(now);
                    sends.push(encode_fixed(&ClientFrame::Ping { rtt_ms: self.ping.rtt_ms }));
                }
            }
        }
        sends
    }

    /// Build one relay frame for sending, claiming its packet id and
    /// registering it for retransmission when reliable over UDP. The
    /// caller puts the returned bytes on the wire.
    pub fn prepare_relay(
        &mut self,
        now: Instant,
        payload: &[u8],
        recipient_mask: u64,
        reliable: bool,
        ordered: bool,
        channel: u8,
    ) -> Result<Vec<u8>, SendError> {
        if payload.len() > MAX_RELAY_PAYLOAD {
            return Err(SendError::PayloadTooLarge(payload.len()));
        }
        if channel >= CHANNEL_COUNT {
            return Err(SendError::BadChannel(channel));
        }
        if self.state != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        // The wire carries 40 mask bits; drop the rest up front so the
        // stream key matches what comes back in acks.
        let recipient_mask = recipient_mask & ((1u64 << MAX_PLAYERS) - 1);
        let stream = StreamKey { reliable, ordered, channel, recipient_mask };
        let packet_id = self.outbound.next_packet_id(stream);
        let header = RelayHeader::new(reliable, ordered, channel, packet_id, recipient_mask);
        let frame = ClientFrame::Relay { header, payload: payload.to_vec() }
            .encode()
            .map_err(|_| SendError::PayloadTooLarge(payload.len()))?;
        if reliable && self.kind == TransportKind::Udp {
            self.outbound.register(AckKey { stream, packet_id }, frame.clone(), now);
        }
        Ok(frame)
    }

    /// Voluntary teardown. Returns a DISCONNECT notice to send first when
    /// the connection is established over UDP. Idempotent, and produces no
    /// callback.
    pub fn begin_disconnect(&mut self) -> Option<Vec<u8>> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        let notice = (self.kind == TransportKind::Udp
            && self.state == ConnectionState::Connected)
            .then(|| encode_fixed(&ClientFrame::Disconnect));
        self.reset();
        info!("disconnected from relay");
        notice
    }

    /// Fatal teardown: clear all connection state and queue the failure
    /// for the application.
    pub fn fail(&mut self, err: RelayError) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        warn!("connection failed: {err}");
        self.reset();
        self.push_event(RelayEvent::ConnectResult { success: false, detail: err.to_string() });
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.identity = IdentityTable::default();
        self.outbound = OutboundReliability::default();
        self.inbound = InboundOrdering::default();
        self.rsmg = RsmgChannel::default();
        self.ping = PingState::default();
    }

    fn handle_rsmg(&mut self, seq: u16, body: Vec<u8>) -> Vec<Vec<u8>> {
        let mut sends = Vec::new();
        if self.kind == TransportKind::Udp {
            // Ack before anything else, duplicates included; the relay
            // may have lost the previous ack.
            sends.push(encode_fixed(&ClientFrame::RsmgAck { seq }));
            match self.rsmg.accept(seq, body) {
                RsmgDelivery::Deliver(bodies) => {
                    for body in bodies {
                        if !self.deliver_system(&body) {
                            break;
                        }
                    }
                }
                RsmgDelivery::Duplicate | RsmgDelivery::Buffered => {}
                RsmgDelivery::Overflow => {
                    self.fail(RelayError::Protocol(
                        "system message reorder buffer overflow".into(),
                    ));
                }
            }
        } else {
            // TCP and WebSocket deliver in order already.
            self.deliver_system(&body);
        }
        sends
    }

    /// Parse one in-sequence system message, apply its side effects, then
    /// queue the raw JSON for the application. Returns false when the body
    /// was malformed and the session has been failed.
    fn deliver_system(&mut self, body: &[u8]) -> bool {
        let msg = match SystemMessage::parse(body) {
            Ok(msg) => msg,
            Err(e) => {
                self.fail(RelayError::Protocol(format!("bad system message: {e}")));
                return false;
            }
        };
        self.apply_system(msg);
        self.push_event(RelayEvent::SystemMessage {
            json: String::from_utf8_lossy(body).into_owned(),
        });
        true
    }

    fn apply_system(&mut self, msg: SystemMessage) {
        match msg {
            SystemMessage::Connect { cx_id, net_id, owner_cx_id } => {
                if let Some(net_id) = net_id {
                    self.identity.upsert(&cx_id, net_id);
                }
                if let Some(owner) = owner_cx_id {
                    self.identity.owner_cx = Some(owner);
                }
                if self.state == ConnectionState::Connecting && cx_id == self.own_cx_id {
                    self.state = ConnectionState::Connected;
                    info!("relay session established");
                    self.push_event(RelayEvent::ConnectResult {
                        success: true,
                        detail: String::new(),
                    });
                }
            }
            SystemMessage::NetId { cx_id, net_id } => self.identity.upsert(&cx_id, net_id),
            SystemMessage::Disconnect { cx_id } => {
                debug!("peer {cx_id} left the session");
                self.identity.remove_cx(&cx_id);
            }
            SystemMessage::MigrateOwner { cx_id } => {
                debug!("session owner is now {cx_id}");
                self.identity.owner_cx = Some(cx_id);
            }
            SystemMessage::Unknown => {}
        }
    }

    fn handle_relay(&mut self, header: &RelayHeader, payload: Vec<u8>) -> Vec<Vec<u8>> {
        let mut sends = Vec::new();
        if self.kind != TransportKind::Udp {
            // Ordering is the transport's job on TCP and WebSocket.
            self.push_event(RelayEvent::RelayMessage { sender: header.sender(), payload });
            return sends;
        }
        if header.reliable {
            // Echo the header back verbatim, for duplicates too.
            sends.push(encode_fixed(&ClientFrame::Ack { header: *header }));
        }
        match self.inbound.accept(header.stream_key(), header.packet_id, header.sender(), payload)
        {
            Delivery::Deliver(items) => {
                for (sender, payload) in items {
                    self.push_event(RelayEvent::RelayMessage { sender, payload });
                }
            }
            Delivery::Duplicate | Delivery::Buffered => {}
            Delivery::Overflow => {
                self.fail(RelayError::Protocol(format!(
                    "reorder buffer overflow on channel {}",
                    header.channel
                )));
            }
        }
        sends
    }

    fn handle_ack(&mut self, header: &RelayHeader) {
        if self.outbound.acknowledge(&header.ack_key()) {
            trace!(
                "ack cleared packet {} on channel {}",
                header.packet_id.value(),
                header.channel
            );
        }
    }

    fn handle_pong(&mut self, now: Instant) {
        if let Some(sent_at) = self.ping.last_sent_at {
            let elapsed = now.duration_since(sent_at).as_millis().min(u128::from(RTT_UNKNOWN_MS));
            self.ping.rtt_ms = elapsed as u16;
        }
    }

    fn ping_due(&self, now: Instant) -> bool {
        match self.ping.last_sent_at {
            None => true,
            Some(at) => now.duration_since(at) >= self.ping_interval,
        }
    }

    /// Check the UDP inactivity deadline, failing the session when it has
    /// passed. Returns whether the session is now dead.
    fn udp_timed_out(&mut self, now: Instant) -> bool {
        let silent_for = now.duration_since(self.last_recv_at);
        if silent_for > INACTIVITY_TIMEOUT {
            self.fail(RelayError::Timeout(format!(
                "nothing received for {} ms",
                silent_for.as_millis()
            )));
            return true;
        }
        false
    }

    fn push_event(&mut self, event: RelayEvent) {
        // A closed receiver just means the client is gone.
        let _ = self.events.send(event);
    }
}
