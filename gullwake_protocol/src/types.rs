// Identity and stream-key types for the relay protocol.
//
// These are lightweight newtypes shared by `frame.rs` (wire layout) and the
// client engine's delivery bookkeeping (`gullwake_relay::reliability`). The
// relay server assigns each peer a compact integer `NetId`; the platform's
// opaque string identifier (cxId) never appears on the binary wire, only in
// JSON bodies.

use serde::{Deserialize, Serialize};

use crate::sequence::PacketId;

/// Maximum peers in one relay session. Doubles as the wire sentinel for
/// "no netId assigned" (see [`NetId::INVALID`]).
pub const MAX_PLAYERS: u8 = 40;

/// Number of independent priority channels a relay stream can be tagged with.
pub const CHANNEL_COUNT: u8 = 4;

/// Relay-assigned peer identity (compact integer, not the platform cxId).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetId(pub u8);

impl NetId {
    /// Wire/JSON sentinel meaning "no netId assigned".
    pub const INVALID: Self = NetId(MAX_PLAYERS);

    /// True for ids that can actually address a peer.
    pub fn is_valid(self) -> bool {
        self.0 < MAX_PLAYERS
    }
}

/// One logical delivery stream. Distinct recipient masks or channels are
/// independent streams, each with its own send and expected counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub reliable: bool,
    pub ordered: bool,
    /// Channel in `[0, CHANNEL_COUNT)`; selects the retransmission backoff class.
    pub channel: u8,
    /// Recipient bitmask, bit i = peer with netId i. Low 40 bits are meaningful.
    pub recipient_mask: u64,
}

/// Identifies one retransmission unit: a stream plus a packet id within it.
///
/// The wire encodes the same information as a packed 64-bit value (see
/// `frame.rs`); in memory a composite key with structural equality is used
/// as the pending-ack map key instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AckKey {
    pub stream: StreamKey,
    pub packet_id: PacketId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_net_id_is_max_players() {
        assert_eq!(NetId::INVALID.0, MAX_PLAYERS);
        assert!(!NetId::INVALID.is_valid());
        assert!(NetId(0).is_valid());
        assert!(NetId(MAX_PLAYERS - 1).is_valid());
    }

    #[test]
    fn net_id_serializes_as_bare_integer() {
        let json = serde_json::to_string(&NetId(7)).unwrap();
        assert_eq!(json, "7");
        let back: NetId = serde_json::from_str("7").unwrap();
        assert_eq!(back, NetId(7));
    }

    #[test]
    fn stream_keys_distinguish_channel_and_mask() {
        let a = StreamKey { reliable: true, ordered: true, channel: 0, recipient_mask: 0b1 };
        let b = StreamKey { channel: 1, ..a };
        let c = StreamKey { recipient_mask: 0b10, ..a };
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
