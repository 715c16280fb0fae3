// Sequence arithmetic for the relay's packet-id space.
//
// Relay packet ids live in a 12-bit space and wrap at 4096. Ordering is
// decided with a quartile rule: an id in the top quarter of the range is
// treated as older than an id in the bottom quarter (the stream has wrapped
// between them). The rule is sound as long as the ids being compared are
// within about a quarter-range of each other, which the 600-entry reorder
// bound guarantees with room to spare.
//
// RSMG system-message sequence ids are not handled here: they are plain
// u16s compared as ordinary integers, since that space resets to 0 on every
// new connection and never wraps in practice.

use std::cmp::Ordering;

/// Number of distinct relay packet ids (12 bits).
pub const PACKET_ID_RANGE: u16 = 4096;

/// Ids below this bound are in the low quartile of the range.
const LOW_QUARTILE: u16 = PACKET_ID_RANGE / 4;

/// Ids at or above this bound are in the high quartile of the range.
const HIGH_QUARTILE: u16 = PACKET_ID_RANGE - PACKET_ID_RANGE / 4;

/// A 12-bit relay packet id.
///
/// Deliberately does not implement `Ord`: the wraparound relation is only a
/// total order within a window, not globally, so ordering is exposed through
/// [`PacketId::seq_cmp`] instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketId(u16);

impl PacketId {
    /// First id issued on a fresh stream.
    pub const ZERO: Self = PacketId(0);

    /// Largest id. A receiver initialized to this expects 0 next.
    pub const MAX: Self = PacketId(PACKET_ID_RANGE - 1);

    /// Wraps `raw` into the 12-bit space.
    pub fn new(raw: u16) -> Self {
        PacketId(raw % PACKET_ID_RANGE)
    }

    pub fn value(self) -> u16 {
        self.0
    }

    /// The id following this one; 4095 wraps to 0.
    #[must_use]
    pub fn next(self) -> Self {
        PacketId((self.0 + 1) % PACKET_ID_RANGE)
    }

    /// Wraparound-aware ordering: high-quartile ids sort before low-quartile
    /// ids (the stream wrapped between them); otherwise plain comparison.
    pub fn seq_cmp(self, other: Self) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        } else if self.0 >= HIGH_QUARTILE && other.0 < LOW_QUARTILE {
            Ordering::Less
        } else if other.0 >= HIGH_QUARTILE && self.0 < LOW_QUARTILE {
            Ordering::Greater
        } else {
            self.0.cmp(&other.0)
        }
    }

    /// True when this id is at or before `other` in stream order. Used for
    /// duplicate detection against a last-delivered id.
    pub fn is_at_or_before(self, other: Self) -> bool {
        self.seq_cmp(other) != Ordering::Greater
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_equal_to_itself() {
        for raw in 0..PACKET_ID_RANGE {
            let id = PacketId::new(raw);
            assert_eq!(id.seq_cmp(id), Ordering::Equal);
            assert!(id.is_at_or_before(id));
        }
    }

    #[test]
    fn next_always_sorts_after() {
        // Including across the wrap boundary: 4095.next() == 0, and
        // 4095 must sort before 0.
        for raw in 0..PACKET_ID_RANGE {
            let id = PacketId::new(raw);
            let next = id.next();
            assert_eq!(id.seq_cmp(next), Ordering::Less, "id {raw}");
            assert_eq!(next.seq_cmp(id), Ordering::Greater, "id {raw}");
        }
    }

    #[test]
    fn wraps_at_range_end() {
        assert_eq!(PacketId::MAX.next(), PacketId::ZERO);
        assert_eq!(PacketId::new(PACKET_ID_RANGE), PacketId::ZERO);
    }

    #[test]
    fn consistent_within_quarter_range_window() {
        // For any id, every id up to a quarter-range ahead sorts after it,
        // wrap or no wrap. Live streams never spread wider than this (the
        // reorder buffer caps at 600 entries).
        for raw in 0..PACKET_ID_RANGE {
            let a = PacketId::new(raw);
            for dist in 1..LOW_QUARTILE {
                let b = PacketId::new((raw + dist) % PACKET_ID_RANGE);
                assert_eq!(a.seq_cmp(b), Ordering::Less, "a={raw} dist={dist}");
                assert_eq!(b.seq_cmp(a), Ordering::Greater, "a={raw} dist={dist}");
            }
        }
    }

    #[test]
    fn high_quartile_sorts_before_low_quartile() {
        assert_eq!(PacketId::new(4000).seq_cmp(PacketId::new(5)), Ordering::Less);
        assert_eq!(PacketId::new(5).seq_cmp(PacketId::new(4000)), Ordering::Greater);
        assert!(PacketId::new(4095).is_at_or_before(PacketId::new(0)));
    }

    #[test]
    fn mid_range_uses_plain_comparison() {
        assert_eq!(PacketId::new(1500).seq_cmp(PacketId::new(2500)), Ordering::Less);
        assert_eq!(PacketId::new(2500).seq_cmp(PacketId::new(1500)), Ordering::Greater);
    }
}
