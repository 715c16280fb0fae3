// Delivery bookkeeping for UDP relay streams.
//
// Three pieces, all plain data guarded by the session lock:
// - `OutboundReliability`: per-stream next-send counters plus the table of
//   sent-but-unacknowledged frames with their resend backoff.
// - `InboundOrdering`: per-stream last-delivered watermarks and reorder
//   buffers for inbound relay frames.
// - `RsmgChannel`: ordering and duplicate suppression for the system
//   message stream, which is always ordered.
//
// Callers pass `Instant::now()` in explicitly so tests can drive time
// without sleeping.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use gullwake_protocol::{AckKey, NetId, PacketId, StreamKey};

/// A reliable frame unacknowledged for longer than this kills the
/// connection.
pub const RELIABLE_DEADLINE: Duration = Duration::from_millis(10_000);

/// Cap on how far the per-frame resend interval backs off.
const MAX_RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Most out-of-order entries one stream will hold (about ten seconds of
/// traffic at a 60 Hz send rate) before the connection is declared dead.
pub const REORDER_LIMIT: usize = 600;

/// How many recently delivered system-message ids are remembered for
/// duplicate suppression.
const RSMG_HISTORY_LIMIT: usize = 600;

/// Initial resend interval for a channel. Lower channels carry
/// latency-sensitive traffic and retry sooner.
fn initial_resend_interval(channel: u8) -> Duration {
    match channel {
        0 | 1 => Duration::from_millis(50),
        2 => Duration::from_millis(150),
        _ => Duration::from_millis(250),
    }
}

/// One sent reliable frame awaiting its ACK.
#[derive(Debug)]
struct PendingReliable {
    /// Exact bytes of the original frame; resends repeat them unchanged.
    frame: Vec<u8>,
    enqueued_at: Instant,
    last_sent_at: Instant,
    resend_interval: Duration,
}

/// Outbound side: next-send counters and the pending-ack table.
#[derive(Debug, Default)]
pub struct OutboundReliability {
    next_send: HashMap<StreamKey, PacketId>,
    pending: HashMap<AckKey, PendingReliable>,
}

impl OutboundReliability {
    /// Claim the next packet id for a stream. Counters start at 0.
    pub fn next_packet_id(&mut self, stream: StreamKey) -> PacketId {
        let entry = self.next_send.entry(stream).or_insert(PacketId::ZERO);
        let id = *entry;
        *entry = entry.next();
        id
    }

    /// Track a sent reliable frame for retransmission.
    pub fn register(&mut self, key: AckKey, frame: Vec<u8>, now: Instant) {
        let interval = initial_resend_interval(key.stream.channel);
        self.pending.insert(
            key,
            PendingReliable { frame, enqueued_at: now, last_sent_at: now, resend_interval: interval },
        );
    }

    /// Drop the entry an ACK refers to. Duplicate and late ACKs are no-ops;
    /// returns whether anything was actually pending.
    pub fn acknowledge(&mut self, key: &AckKey) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Collect frames whose resend interval has elapsed, growing each
    /// one's backoff by a quarter up to the cap. Returns `Err` with the
    /// offending age when any entry has outlived `RELIABLE_DEADLINE`.
    pub fn sweep(&mut self, now: Instant) -> Result<Vec<Vec<u8>>, Duration> {
        let mut due = Vec::new();
        for entry in self.pending.values_mut() {
            let age = now.duration_since(entry.enqueued_at);
            if age > RELIABLE_DEADLINE {
                return Err(age);
            }
            if now.duration_since(entry.last_sent_at) > entry.resend_interval {
                due.push(entry.frame.clone());
                entry.last_sent_at = now;
                entry.resend_interval =
                    (entry.resend_interval + entry.resend_interval / 4).min(MAX_RESEND_INTERVAL);
            }
        }
        Ok(due)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &AckKey) -> bool {
        self.pending.contains_key(key)
    }
}

/// Inbound side of one ordered stream.
#[derive(Debug)]
struct InboundStream {
    last_delivered: PacketId,
    /// Sorted by wraparound order; never holds a duplicate id.
    buffered: Vec<(PacketId, NetId, Vec<u8>)>,
}

impl Default for InboundStream {
    fn default() -> Self {
        // A fresh stream expects packet 0 next.
        InboundStream { last_delivered: PacketId::MAX, buffered: Vec::new() }
    }
}

/// What to do with one inbound relay frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Surface these payloads, in order.
    Deliver(Vec<(NetId, Vec<u8>)>),
    /// Already seen or stale; drop without surfacing.
    Duplicate,
    /// Held back until the sequence gap fills.
    Buffered,
    /// The stream's reorder buffer is full; the connection must drop.
    Overflow,
}

/// Inbound ordering state across all relay streams.
#[derive(Debug, Default)]
pub struct InboundOrdering {
    streams: HashMap<StreamKey, InboundStream>,
}

impl InboundOrdering {
    /// Apply the stream's ordering policy to one inbound relay frame.
    /// Acking is the caller's business and happens even when the result
    /// is `Duplicate`.
    pub fn accept(
        &mut self,
        stream: StreamKey,
        id: PacketId,
        sender: NetId,
        payload: Vec<u8>,
    ) -> Delivery {
        if !stream.ordered {
            return Delivery::Deliver(vec![(sender, payload)]);
        }
        let state = self.streams.entry(stream).or_default();
        if id.is_at_or_before(state.last_delivered) {
            return Delivery::Duplicate;
        }
        if !stream.reliable {
            // Ordered but unreliable: newest wins, gaps are abandoned.
            state.last_delivered = id;
            return Delivery::Deliver(vec![(sender, payload)]);
        }
        if id == state.last_delivered.next() {
            state.last_delivered = id;
            let mut out = vec![(sender, payload)];
            while let Some((next_id, _, _)) = state.buffered.first() {
                if *next_id != state.last_delivered.next() {
                    break;
                }
                let (next_id, from, bytes) = state.buffered.remove(0);
                state.last_delivered = next_id;
                out.push((from, bytes));
            }
            return Delivery::Deliver(out);
        }
        if state.buffered.iter().any(|(held, _, _)| *held == id) {
            return Delivery::Duplicate;
        }
        if state.buffered.len() >= REORDER_LIMIT {
            return Delivery::Overflow;
        }
        let pos = state.buffered.partition_point(|(held, _, _)| held.seq_cmp(id) == Ordering::Less);
        state.buffered.insert(pos, (id, sender, payload));
        Delivery::Buffered
    }
}

/// What to do with one inbound system message frame.
#[derive(Debug, PartialEq, Eq)]
pub enum RsmgDelivery {
    /// Process and surface these bodies, in order.
    Deliver(Vec<Vec<u8>>),
    /// Already delivered; drop it (the ack still goes out).
    Duplicate,
    /// Held back until the sequence gap fills.
    Buffered,
    /// The reorder buffer is full; the connection must drop.
    Overflow,
}

/// Ordering and duplicate suppression for the system message stream.
/// Sequence numbers count up from 0 per connection and are compared as
/// plain integers.
#[derive(Debug, Default)]
pub struct RsmgChannel {
    expected: u16,
    /// Sorted ascending by sequence number.
    buffered: Vec<(u16, Vec<u8>)>,
    history: VecDeque<u16>,
}

impl RsmgChannel {
    /// Apply ordering to one inbound system message.
    pub fn accept(&mut self, seq: u16, body: Vec<u8>) -> RsmgDelivery {
        if seq < self.expected || self.history.contains(&seq) {
            return RsmgDelivery::Duplicate;
        }
        if seq == self.expected {
            self.remember(seq);
            self.expected = self.expected.wrapping_add(1);
            let mut out = vec![body];
            while let Some((next_seq, _)) = self.buffered.first() {
                if *next_seq != self.expected {
                    break;
                }
                let (next_seq, bytes) = self.buffered.remove(0);
                self.remember(next_seq);
                self.expected = self.expected.wrapping_add(1);
                out.push(bytes);
            }
            return RsmgDelivery::Deliver(out);
        }
        if self.buffered.iter().any(|(held, _)| *held == seq) {
            return RsmgDelivery::Duplicate;
        }
        if self.buffered.len() >= REORDER_LIMIT {
            return RsmgDelivery::Overflow;
        }
        let pos = self.buffered.partition_point(|(held, _)| *held < seq);
        self.buffered.insert(pos, (seq, body));
        RsmgDelivery::Buffered
    }

    fn remember(&mut self, seq: u16) {
        if self.history.len() >= RSMG_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(reliable: bool, ordered: bool, channel: u8) -> StreamKey {
        StreamKey { reliable, ordered, channel, recipient_mask: 0b11 }
    }

    fn key(stream: StreamKey, id: u16) -> AckKey {
        AckKey { stream, packet_id: PacketId::new(id) }
    }

    #[test]
    fn packet_ids_advance_independently_per_stream() {
        let mut outbound = OutboundReliability::default();
        let a = stream(true, true, 0);
        let b = stream(true, true, 1);
        assert_eq!(outbound.next_packet_id(a), PacketId::ZERO);
        assert_eq!(outbound.next_packet_id(a), PacketId::new(1));
        assert_eq!(outbound.next_packet_id(b), PacketId::ZERO);
        assert_eq!(outbound.next_packet_id(a), PacketId::new(2));
    }

    #[test]
    fn acknowledge_removes_pending_once() {
        let mut outbound = OutboundReliability::default();
        let now = Instant::now();
        let k = key(stream(true, false, 0), 0);
        outbound.register(k, vec![1, 2, 3], now);
        assert!(outbound.is_pending(&k));
        assert!(outbound.acknowledge(&k));
        assert!(!outbound.acknowledge(&k));
        assert_eq!(outbound.pending_len(), 0);
    }

    #[test]
    fn sweep_resends_with_growing_backoff() {
        let mut outbound = OutboundReliability::default();
        let base = Instant::now();
        let k = key(stream(true, true, 0), 0);
        outbound.register(k, vec![0xAA], base);

        // Channel 0 starts at 50 ms; nothing is due before that.
        assert_eq!(outbound.sweep(base + Duration::from_millis(50)), Ok(vec![]));
        let due = outbound.sweep(base + Duration::from_millis(51));
        assert_eq!(due, Ok(vec![vec![0xAA]]));

        // The interval grew to 62.5 ms, measured from the resend.
        let resent_at = base + Duration::from_millis(51);
        assert_eq!(outbound.sweep(resent_at + Duration::from_millis(62)), Ok(vec![]));
        let due = outbound.sweep(resent_at + Duration::from_millis(63));
        assert_eq!(due, Ok(vec![vec![0xAA]]));
    }

    #[test]
    fn resend_interval_caps_at_half_a_second() {
        let mut outbound = OutboundReliability::default();
        let base = Instant::now();
        let k = key(stream(true, true, 3), 0);
        outbound.register(k, vec![0xBB], base);

        // Channel 3 starts at 250 ms and grows 312.5, 390.6, 488.3, then
        // hits the 500 ms cap. Sweep with gaps wide enough to resend every
        // time, then probe both sides of the cap.
        let mut at = base;
        for gap in [300, 320, 400, 490, 510] {
            at += Duration::from_millis(gap);
            let due = outbound.sweep(at);
            assert_eq!(due, Ok(vec![vec![0xBB]]), "expected a resend after {gap} ms");
        }
        assert_eq!(outbound.sweep(at + Duration::from_millis(499)), Ok(vec![]));
        let due = outbound.sweep(at + Duration::from_millis(501));
        assert_eq!(due, Ok(vec![vec![0xBB]]));
    }

    #[test]
    fn unacknowledged_frame_expires_after_deadline() {
        let mut outbound = OutboundReliability::default();
        let base = Instant::now();
        outbound.register(key(stream(true, true, 0), 0), vec![0xCC], base);

        assert!(outbound.sweep(base + RELIABLE_DEADLINE).is_ok());
        let expired = outbound.sweep(base + RELIABLE_DEADLINE + Duration::from_millis(1));
        match expired {
            Err(age) => assert!(age > RELIABLE_DEADLINE),
            Ok(due) => panic!("expected expiry, got resends {due:?}"),
        }
    }

    #[test]
    fn ordered_reliable_stream_reorders_and_drains() {
        let mut inbound = InboundOrdering::default();
        let s = stream(true, true, 0);
        let from = NetId(4);

        assert_eq!(
            inbound.accept(s, PacketId::new(2), from, b"two".to_vec()),
            Delivery::Buffered
        );
        assert_eq!(
            inbound.accept(s, PacketId::new(0), from, b"zero".to_vec()),
            Delivery::Deliver(vec![(from, b"zero".to_vec())])
        );
        // Packet 1 fills the gap and releases 2 behind it.
        assert_eq!(
            inbound.accept(s, PacketId::new(1), from, b"one".to_vec()),
            Delivery::Deliver(vec![(from, b"one".to_vec()), (from, b"two".to_vec())])
        );
    }

    #[test]
    fn delivered_and_buffered_duplicates_are_dropped() {
        let mut inbound = InboundOrdering::default();
        let s = stream(true, true, 1);
        let from = NetId(0);

        assert!(matches!(inbound.accept(s, PacketId::new(0), from, vec![1]), Delivery::Deliver(_)));
        assert_eq!(inbound.accept(s, PacketId::new(0), from, vec![1]), Delivery::Duplicate);
        assert_eq!(inbound.accept(s, PacketId::new(5), from, vec![5]), Delivery::Buffered);
        assert_eq!(inbound.accept(s, PacketId::new(5), from, vec![5]), Delivery::Duplicate);
    }

    #[test]
    fn reorder_buffer_overflow_is_fatal() {
        let mut inbound = InboundOrdering::default();
        let s = stream(true, true, 0);
        let from = NetId(1);

        // Packet 0 never arrives, so everything after it piles up.
        for id in 1..=u16::try_from(REORDER_LIMIT).unwrap() {
            assert_eq!(inbound.accept(s, PacketId::new(id), from, vec![]), Delivery::Buffered);
        }
        let one_too_many = u16::try_from(REORDER_LIMIT).unwrap() + 1;
        assert_eq!(inbound.accept(s, PacketId::new(one_too_many), from, vec![]), Delivery::Overflow);
    }

    #[test]
    fn ordered_unreliable_stream_discards_stale_packets() {
        let mut inbound = InboundOrdering::default();
        let s = stream(false, true, 2);
        let from = NetId(2);

        assert!(matches!(inbound.accept(s, PacketId::new(5), from, vec![5]), Delivery::Deliver(_)));
        assert_eq!(inbound.accept(s, PacketId::new(3), from, vec![3]), Delivery::Duplicate);
        assert!(matches!(inbound.accept(s, PacketId::new(7), from, vec![7]), Delivery::Deliver(_)));
    }

    #[test]
    fn unordered_stream_delivers_everything_immediately() {
        let mut inbound = InboundOrdering::default();
        let s = stream(false, false, 0);
        let from = NetId(3);

        for id in [9, 4, 9, 0] {
            assert_eq!(
                inbound.accept(s, PacketId::new(id), from, vec![id as u8]),
                Delivery::Deliver(vec![(from, vec![id as u8])])
            );
        }
    }

    #[test]
    fn streams_do_not_share_ordering_state() {
        let mut inbound = InboundOrdering::default();
        let a = stream(true, true, 0);
        let b = stream(true, true, 3);
        let from = NetId(0);

        assert_eq!(inbound.accept(a, PacketId::new(1), from, vec![]), Delivery::Buffered);
        // Stream b still expects 0 even though a has packet 1 buffered.
        assert!(matches!(inbound.accept(b, PacketId::new(0), from, vec![]), Delivery::Deliver(_)));
    }

    #[test]
    fn system_messages_reorder_and_drain() {
        let mut rsmg = RsmgChannel::default();

        assert_eq!(rsmg.accept(0, b"a".to_vec()), RsmgDelivery::Deliver(vec![b"a".to_vec()]));
        assert_eq!(rsmg.accept(2, b"c".to_vec()), RsmgDelivery::Buffered);
        assert_eq!(
            rsmg.accept(1, b"b".to_vec()),
            RsmgDelivery::Deliver(vec![b"b".to_vec(), b"c".to_vec()])
        );
    }

    #[test]
    fn system_message_duplicates_are_dropped() {
        let mut rsmg = RsmgChannel::default();

        assert!(matches!(rsmg.accept(0, vec![]), RsmgDelivery::Deliver(_)));
        assert!(matches!(rsmg.accept(1, vec![]), RsmgDelivery::Deliver(_)));
        assert_eq!(rsmg.accept(0, vec![]), RsmgDelivery::Duplicate);
        assert_eq!(rsmg.accept(3, vec![]), RsmgDelivery::Buffered);
        assert_eq!(rsmg.accept(3, vec![]), RsmgDelivery::Duplicate);
    }

    #[test]
    fn system_message_buffer_overflow_is_fatal() {
        let mut rsmg = RsmgChannel::default();

        // Sequence 0 never arrives.
        for seq in 1..=u16::try_from(REORDER_LIMIT).unwrap() {
            assert_eq!(rsmg.accept(seq, vec![]), RsmgDelivery::Buffered);
        }
        let one_too_many = u16::try_from(REORDER_LIMIT).unwrap() + 1;
        assert_eq!(rsmg.accept(one_too_many, vec![]), RsmgDelivery::Overflow);
    }
}
