// Events handed from network threads to the application drain.
//
// Network threads never invoke application callbacks. They queue events
// on an mpsc channel and `RelayClient::process_events` dispatches them
// on the caller's thread, in arrival order, with no locks held.

use gullwake_protocol::NetId;

/// One application-visible event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    /// Outcome of a connection attempt, or a later fatal failure.
    /// `success` is reported true exactly once per completed handshake;
    /// failures carry a rendered reason and always leave the client
    /// disconnected.
    ConnectResult { success: bool, detail: String },
    /// A relayed payload from another peer.
    RelayMessage { sender: NetId, payload: Vec<u8> },
    /// The raw JSON body of a system message, queued after its side
    /// effects have been applied to the identity table.
    SystemMessage { json: String },
}

/// Connect-result sink registered through `connect()`.
pub type ConnectCallback = Box<dyn FnMut(bool, &str) + Send>;

/// Relay-message sink.
pub type RelayCallback = Box<dyn FnMut(NetId, &[u8]) + Send>;

/// System-message sink, fed raw JSON bodies.
pub type SystemCallback = Box<dyn FnMut(&str) + Send>;
