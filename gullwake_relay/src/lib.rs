// gullwake_relay: client-side transport engine for the Gullwake relay.
//
// Connects a game client to the central relay over WebSocket, TCP, or UDP
// and hides the difference between them: frames sent through TCP and
// WebSocket arrive ordered and intact on their own, while the UDP path
// gains reliability, ordering, deduplication, and timeout detection here.
// The relay forwards payloads between session peers addressed by a
// recipient bitmask; it never inspects them.
//
// Module overview:
// - `session.rs`:     Connection state machine: handshake, identity
//                     table, relay/ack/system-message handling, timers.
//                     Pure data plus an event queue; no sockets.
// - `reliability.rs`: Retransmission, reorder buffers, and duplicate
//                     suppression for the UDP path.
// - `transport.rs`:   The three socket backends and their reader threads.
// - `client.rs`:      `RelayClient`, the public API: connect, send,
//                     queries, and the `process_events` callback drain.
// - `events.rs`:      Event and callback types.
// - `error.rs`:       Failure taxonomy.
//
// Design decisions:
// - One blocking reader thread per connection, feeding a shared session
//   behind a mutex; an mpsc channel carries events to the application.
//   Callbacks only ever run inside `process_events` on the caller's
//   thread, with no locks held.
// - The session does no I/O. Its methods return the frames to send, so
//   the whole engine is testable with fabricated clocks and buffers.
// - All connection failures, including immediate connect errors, arrive
//   asynchronously through the connect-result callback.
//
// Dependencies: `gullwake_protocol` (frame codec and shared types),
// `tungstenite` for the WebSocket transport, `serde_json` for the
// handshake body, `thiserror` and `log`.

pub mod client;
pub mod error;
pub mod events;
pub mod reliability;
pub mod session;
pub mod transport;

pub use client::{ClientConfig, ConnectOptions, RelayClient};
pub use error::{RelayError, SendError};
pub use events::RelayEvent;
pub use gullwake_protocol::{MAX_RELAY_PAYLOAD, NetId};
pub use session::{ConnectionState, RTT_UNKNOWN_MS};
pub use transport::TransportKind;
