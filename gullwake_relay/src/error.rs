// Failure taxonomy for the relay client.
//
// `RelayError` covers everything that can end a connection; it is rendered
// with `Display` into the human-readable string handed to the
// connect-result callback. `SendError` covers the local validation
// failures of `send_relay`, which are the only send failures the caller
// sees directly.

use gullwake_protocol::{CHANNEL_COUNT, FrameError, MAX_RELAY_PAYLOAD};
use thiserror::Error;

/// Why a connection attempt or a live connection ended.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Connect-time failure: bad options, socket open or handshake errors.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The relay broke the wire protocol. Always fatal.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A send or receive failed at the socket level.
    #[error("network error: {0}")]
    Io(String),
    /// A UDP inactivity or retransmission deadline expired.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The relay closed the session with an explicit notice.
    #[error("disconnected by server")]
    ServerClosed,
}

impl From<FrameError> for RelayError {
    fn from(e: FrameError) -> Self {
        RelayError::Protocol(e.to_string())
    }
}

/// Local validation failures from `send_relay`. Transport-level failures
/// never surface here; they tear the connection down and arrive through
/// the connect-result callback instead.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The payload exceeds the relay's per-frame limit.
    #[error("payload of {0} bytes exceeds the {MAX_RELAY_PAYLOAD}-byte relay limit")]
    PayloadTooLarge(usize),
    /// The channel index is outside `0..CHANNEL_COUNT`.
    #[error("channel {0} out of range (0..{CHANNEL_COUNT})")]
    BadChannel(u8),
    /// No connection is established.
    #[error("not connected")]
    NotConnected,
}
