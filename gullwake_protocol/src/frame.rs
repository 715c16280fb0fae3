// Binary frame layout for the relay wire protocol.
//
// Every frame is: 2-byte big-endian total length (counting itself and the
// control byte), then a 1-byte control code, then a control-specific
// payload. Control codes are direction-specific (byte 0 means CONNECT
// upstream but RSMG downstream), so the codec exposes two enums:
// `ClientFrame` (client to server) and `ServerFrame` (server to client).
// The client encodes the former and decodes the latter; test relay stubs
// do the reverse through the same types.
//
// Relay-data and ack frames start with an 8-byte relay header: a 16-bit
// word packing reliable|ordered|channel|packetId, then three 16-bit words
// holding a 48-bit block: the up-to-40-bit recipient bitmask with its bit
// order reversed and shifted left 8, leaving the low byte for the sender's
// netId (stamped by the server; zero on client sends). The reversed-bit
// layout matches what the relay server expects and is pinned by byte-level
// tests below; do not rederive it.

use thiserror::Error;

use crate::sequence::PacketId;
use crate::types::{AckKey, MAX_PLAYERS, NetId, StreamKey};

/// Minimum bytes in any frame: length prefix plus control byte.
pub const MIN_FRAME_LEN: usize = 3;

/// Minimum bytes in a frame whose payload starts with a u16 (RSMG,
/// RSMG_ACK, PING, PONG).
pub const MIN_SEQ_FRAME_LEN: usize = 5;

/// Minimum bytes in a relay or ack frame: generic header plus relay header.
pub const MIN_RELAY_FRAME_LEN: usize = MIN_FRAME_LEN + RELAY_HEADER_LEN;

/// Size of the relay header block (flags word + packed mask).
pub const RELAY_HEADER_LEN: usize = 8;

/// Largest relay message body the protocol allows.
pub const MAX_RELAY_PAYLOAD: usize = 1024;

/// Largest complete relay frame (header block plus a full payload).
pub const MAX_RELAY_FRAME_LEN: usize = MIN_RELAY_FRAME_LEN + MAX_RELAY_PAYLOAD;

/// Client→server control codes.
mod c2s {
    pub const CONNECT: u8 = 0;
    pub const DISCONNECT: u8 = 1;
    pub const RELAY: u8 = 2;
    pub const ACK: u8 = 3;
    pub const PING: u8 = 4;
    pub const RSMG_ACK: u8 = 5;
}

/// Server→client control codes.
mod s2c {
    pub const RSMG: u8 = 0;
    pub const DISCONNECT: u8 = 1;
    pub const RELAY: u8 = 2;
    pub const ACK: u8 = 3;
    pub const PONG: u8 = 4;
}

/// Errors produced by frame encoding and decoding. Every decode error is
/// fatal for the connection that produced the frame.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the generic header needs.
    #[error("truncated frame: {got} bytes, need at least {MIN_FRAME_LEN}")]
    Truncated { got: usize },
    /// Length prefix disagrees with the bytes actually present.
    #[error("length prefix says {declared} bytes but frame has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    /// Frame shorter than the minimum for its control code.
    #[error("undersized frame for control {control}: {got} bytes, need {need}")]
    Undersized { control: u8, got: usize, need: usize },
    /// Control byte not defined for this direction.
    #[error("unknown control byte {0}")]
    UnknownControl(u8),
    /// Relay message body over the protocol limit.
    #[error("relay payload of {0} bytes exceeds the {MAX_RELAY_PAYLOAD}-byte limit")]
    PayloadTooLarge(usize),
    /// Encoded frame would not fit the 16-bit length prefix.
    #[error("frame of {0} bytes cannot be length-prefixed")]
    Oversize(usize),
}

/// The 8-byte header block at the start of relay and ack payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayHeader {
    pub reliable: bool,
    pub ordered: bool,
    /// Channel in `[0, 3]`; only the low two bits fit the wire.
    pub channel: u8,
    pub packet_id: PacketId,
    /// 48-bit packed block: bit-reversed recipient mask shifted left 8, with
    /// the sender's netId in the low byte.
    pub packed_mask: u64,
}

impl RelayHeader {
    /// Header for a client send: recipient mask packed, sender byte zero.
    pub fn new(
        reliable: bool,
        ordered: bool,
        channel: u8,
        packet_id: PacketId,
        recipient_mask: u64,
    ) -> Self {
        Self::with_sender(reliable, ordered, channel, packet_id, recipient_mask, NetId(0))
    }

    /// Header as the server stamps it on delivery: recipient mask plus the
    /// sending peer's netId in the low byte.
    pub fn with_sender(
        reliable: bool,
        ordered: bool,
        channel: u8,
        packet_id: PacketId,
        recipient_mask: u64,
        sender: NetId,
    ) -> Self {
        RelayHeader {
            reliable,
            ordered,
            channel,
            packet_id,
            packed_mask: (reverse_mask_bits(recipient_mask) << 8) | u64::from(sender.0),
        }
    }

    /// The peer this frame came from (meaningful on server→client frames).
    pub fn sender(&self) -> NetId {
        NetId((self.packed_mask & 0xFF) as u8)
    }

    /// The recipient bitmask as the application supplied it.
    pub fn recipient_mask(&self) -> u64 {
        reverse_mask_bits(self.packed_mask >> 8)
    }

    /// The logical stream this frame belongs to.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            reliable: self.reliable,
            ordered: self.ordered,
            channel: self.channel,
            recipient_mask: self.recipient_mask(),
        }
    }

    /// The retransmission-unit key for this frame.
    pub fn ack_key(&self) -> AckKey {
        AckKey { stream: self.stream_key(), packet_id: self.packet_id }
    }

    fn flags_word(&self) -> u16 {
        let mut word = self.packet_id.value() & 0x0FFF;
        word |= (u16::from(self.channel) & 0x3) << 12;
        if self.ordered {
            word |= 1 << 14;
        }
        if self.reliable {
            word |= 1 << 15;
        }
        word
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.flags_word().to_be_bytes());
        // 48-bit packed block as three big-endian 16-bit words.
        let m = self.packed_mask;
        buf.extend_from_slice(&[
            (m >> 40) as u8,
            (m >> 32) as u8,
            (m >> 24) as u8,
            (m >> 16) as u8,
            (m >> 8) as u8,
            m as u8,
        ]);
    }

    /// Parse from exactly `RELAY_HEADER_LEN` bytes (caller checks length).
    fn parse(bytes: &[u8]) -> Self {
        let word = u16::from_be_bytes([bytes[0], bytes[1]]);
        let mut packed = 0u64;
        for &b in &bytes[2..RELAY_HEADER_LEN] {
            packed = (packed << 8) | u64::from(b);
        }
        RelayHeader {
            reliable: word & (1 << 15) != 0,
            ordered: word & (1 << 14) != 0,
            channel: ((word >> 12) & 0x3) as u8,
            packet_id: PacketId::new(word & 0x0FFF),
            packed_mask: packed,
        }
    }
}

/// Reverse the low 40 bits of `mask` (bit i moves to bit 39 - i). Bits at or
/// above `MAX_PLAYERS` are dropped. Applying this twice is the identity.
fn reverse_mask_bits(mask: u64) -> u64 {
    let width = u64::from(MAX_PLAYERS);
    let mut out = 0u64;
    for bit in 0..width {
        if mask & (1 << bit) != 0 {
            out |= 1 << (width - 1 - bit);
        }
    }
    out
}

/// One client→server frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    /// Session handshake: JSON `{lobbyId, cxId, passcode, version}`.
    Connect { payload: Vec<u8> },
    /// Graceful leave notice.
    Disconnect,
    /// Application payload addressed to a recipient mask.
    Relay { header: RelayHeader, payload: Vec<u8> },
    /// Acknowledges one reliable relay frame by echoing its header.
    Ack { header: RelayHeader },
    /// Heartbeat carrying the last measured round-trip time.
    Ping { rtt_ms: u16 },
    /// Acknowledges one system message by sequence id.
    RsmgAck { seq: u16 },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            ClientFrame::Connect { payload } => encode_body(c2s::CONNECT, payload),
            ClientFrame::Disconnect => frame_buf(MIN_FRAME_LEN, c2s::DISCONNECT),
            ClientFrame::Relay { header, payload } => encode_relay(c2s::RELAY, header, payload),
            ClientFrame::Ack { header } => encode_ack(c2s::ACK, header),
            ClientFrame::Ping { rtt_ms } => encode_u16(c2s::PING, *rtt_ms),
            ClientFrame::RsmgAck { seq } => encode_u16(c2s::RSMG_ACK, *seq),
        }
    }

    /// Decode one complete client→server frame, length prefix included.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let control = check_frame(bytes)?;
        match control {
            c2s::CONNECT => Ok(ClientFrame::Connect { payload: bytes[MIN_FRAME_LEN..].to_vec() }),
            c2s::DISCONNECT => Ok(ClientFrame::Disconnect),
            c2s::RELAY => {
                let (header, payload) = decode_relay(bytes, control)?;
                Ok(ClientFrame::Relay { header, payload })
            }
            c2s::ACK => Ok(ClientFrame::Ack { header: decode_ack(bytes, control)? }),
            c2s::PING => Ok(ClientFrame::Ping { rtt_ms: decode_u16(bytes, control)? }),
            c2s::RSMG_ACK => Ok(ClientFrame::RsmgAck { seq: decode_u16(bytes, control)? }),
            other => Err(FrameError::UnknownControl(other)),
        }
    }
}

/// One server→client frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerFrame {
    /// System message: sequence id plus a JSON body with an `op` field.
    Rsmg { seq: u16, body: Vec<u8> },
    /// Server-initiated teardown.
    Disconnect,
    /// Relayed application payload from another peer.
    Relay { header: RelayHeader, payload: Vec<u8> },
    /// Acknowledges one reliable relay frame this client sent.
    Ack { header: RelayHeader },
    /// Heartbeat reply.
    Pong { rtt_ms: u16 },
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            ServerFrame::Rsmg { seq, body } => {
                let mut buf = frame_buf(MIN_SEQ_FRAME_LEN + body.len(), s2c::RSMG)?;
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(body);
                Ok(buf)
            }
            ServerFrame::Disconnect => frame_buf(MIN_FRAME_LEN, s2c::DISCONNECT),
            ServerFrame::Relay { header, payload } => encode_relay(s2c::RELAY, header, payload),
            ServerFrame::Ack { header } => encode_ack(s2c::ACK, header),
            ServerFrame::Pong { rtt_ms } => encode_u16(s2c::PONG, *rtt_ms),
        }
    }

    /// Decode one complete server→client frame, length prefix included.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let control = check_frame(bytes)?;
        match control {
            s2c::RSMG => {
                require(bytes, control, MIN_SEQ_FRAME_LEN)?;
                Ok(ServerFrame::Rsmg {
                    seq: read_u16(bytes, MIN_FRAME_LEN),
                    body: bytes[MIN_SEQ_FRAME_LEN..].to_vec(),
                })
            }
            s2c::DISCONNECT => Ok(ServerFrame::Disconnect),
            s2c::RELAY => {
                let (header, payload) = decode_relay(bytes, control)?;
                Ok(ServerFrame::Relay { header, payload })
            }
            s2c::ACK => Ok(ServerFrame::Ack { header: decode_ack(bytes, control)? }),
            s2c::PONG => Ok(ServerFrame::Pong { rtt_ms: decode_u16(bytes, control)? }),
            other => Err(FrameError::UnknownControl(other)),
        }
    }
}

/// Start a frame: length prefix plus control byte, capacity for the rest.
fn frame_buf(total: usize, control: u8) -> Result<Vec<u8>, FrameError> {
    if total > usize::from(u16::MAX) {
        return Err(FrameError::Oversize(total));
    }
    let mut buf = Vec::with_capacity(total);
    #[expect(clippy::cast_possible_truncation)]
    let prefix = (total as u16).to_be_bytes();
    buf.extend_from_slice(&prefix);
    buf.push(control);
    Ok(buf)
}

fn encode_body(control: u8, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut buf = frame_buf(MIN_FRAME_LEN + body.len(), control)?;
    buf.extend_from_slice(body);
    Ok(buf)
}

fn encode_u16(control: u8, value: u16) -> Result<Vec<u8>, FrameError> {
    let mut buf = frame_buf(MIN_SEQ_FRAME_LEN, control)?;
    buf.extend_from_slice(&value.to_be_bytes());
    Ok(buf)
}

fn encode_ack(control: u8, header: &RelayHeader) -> Result<Vec<u8>, FrameError> {
    let mut buf = frame_buf(MIN_RELAY_FRAME_LEN, control)?;
    header.write_to(&mut buf);
    Ok(buf)
}

fn encode_relay(control: u8, header: &RelayHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_RELAY_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut buf = frame_buf(MIN_RELAY_FRAME_LEN + payload.len(), control)?;
    header.write_to(&mut buf);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Validate the generic header: length, prefix consistency. Returns the
/// control byte.
fn check_frame(bytes: &[u8]) -> Result<u8, FrameError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::Truncated { got: bytes.len() });
    }
    let declared = usize::from(read_u16(bytes, 0));
    if declared != bytes.len() {
        return Err(FrameError::LengthMismatch { declared, actual: bytes.len() });
    }
    Ok(bytes[2])
}

fn require(bytes: &[u8], control: u8, need: usize) -> Result<(), FrameError> {
    if bytes.len() < need {
        return Err(FrameError::Undersized { control, got: bytes.len(), need });
    }
    Ok(())
}

fn decode_u16(bytes: &[u8], control: u8) -> Result<u16, FrameError> {
    require(bytes, control, MIN_SEQ_FRAME_LEN)?;
    Ok(read_u16(bytes, MIN_FRAME_LEN))
}

fn decode_ack(bytes: &[u8], control: u8) -> Result<RelayHeader, FrameError> {
    require(bytes, control, MIN_RELAY_FRAME_LEN)?;
    Ok(RelayHeader::parse(&bytes[MIN_FRAME_LEN..MIN_RELAY_FRAME_LEN]))
}

fn decode_relay(bytes: &[u8], control: u8) -> Result<(RelayHeader, Vec<u8>), FrameError> {
    let header = decode_ack(bytes, control)?;
    let payload = &bytes[MIN_RELAY_FRAME_LEN..];
    if payload.len() > MAX_RELAY_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    Ok((header, payload.to_vec()))
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}
