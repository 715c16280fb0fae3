// gullwake_protocol: wire protocol for the Gullwake relay transport.
//
// Defines the framed byte layout, sequence arithmetic, and JSON system
// message types shared by the relay client (`gullwake_relay`) and any
// relay-side tooling; the integration-test relay stubs speak the server
// side of the protocol through these same types. Everything here is pure
// and I/O-free, which keeps the delivery logic in the relay crate testable
// without sockets.
//
// Module overview:
// - `types.rs`:    `NetId`, `StreamKey`, `AckKey`, session-wide constants.
// - `sequence.rs`: the 12-bit wraparound packet-id space (`PacketId`).
// - `frame.rs`:    frame encode/decode for both directions, the relay
//                  header and recipient-mask packing, `FrameError`.
// - `system.rs`:   CONNECT handshake payload and RSMG system-message JSON.
//
// Design decisions:
// - **Two frame enums, one codec.** Control bytes are direction-specific
//   (0 is CONNECT upstream, RSMG downstream), so `ClientFrame` and
//   `ServerFrame` are separate types rather than one enum with ambiguous
//   meanings.
// - **Bit-exact mask packing.** The 48-bit recipient-mask block keeps the
//   server's reversed-bit layout, pinned by byte-level tests, instead of a
//   rederived one.
// - **JSON only where the server uses JSON.** The handshake and RSMG
//   bodies go through serde_json; everything else is hand-packed
//   big-endian bytes.

pub mod frame;
pub mod sequence;
pub mod system;
pub mod types;

pub use frame::{ClientFrame, FrameError, MAX_RELAY_PAYLOAD, RelayHeader, ServerFrame};
pub use sequence::PacketId;
pub use system::{ConnectPayload, SystemMessage};
pub use types::{AckKey, CHANNEL_COUNT, MAX_PLAYERS, NetId, StreamKey};
