// JSON bodies carried in CONNECT handshakes and RSMG system frames.
//
// The relay server speaks camelCase JSON for both, so every field here
// carries a serde rename. RSMG bodies are tagged on a required `op` field;
// ops this client does not interpret deserialize as `Unknown` and are still
// forwarded to the application as raw JSON, since the server may add event
// types without breaking older clients.

use serde::{Deserialize, Serialize};

use crate::types::NetId;

/// CONNECT handshake payload, ASCII JSON on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    pub lobby_id: String,
    /// Connection identifier issued by the platform's real-time layer.
    pub cx_id: String,
    pub passcode: String,
    pub version: String,
}

/// System events delivered on the RSMG stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMessage {
    /// A peer joined the session. When `cxId` is this client's own, the
    /// connection handshake is complete.
    #[serde(rename_all = "camelCase")]
    Connect {
        cx_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        net_id: Option<NetId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_cx_id: Option<String>,
    },
    /// Assigns a netId to a peer; the invalid sentinel clears the mapping.
    #[serde(rename_all = "camelCase")]
    NetId { cx_id: String, net_id: NetId },
    /// A peer left the session.
    #[serde(rename_all = "camelCase")]
    Disconnect { cx_id: String },
    /// Session ownership moved to the named peer.
    #[serde(rename_all = "camelCase")]
    MigrateOwner { cx_id: String },
    /// Any op this client does not interpret.
    #[serde(other)]
    Unknown,
}

impl SystemMessage {
    /// Parse an RSMG body. Any parse failure means the frame is malformed
    /// (the `op` field is required), which callers treat as fatal.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_uses_camel_case_fields() {
        let payload = ConnectPayload {
            lobby_id: "lobby-7".into(),
            cx_id: "a:12345:b".into(),
            passcode: "hunter2".into(),
            version: "1".into(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(
            json,
            r#"{"lobbyId":"lobby-7","cxId":"a:12345:b","passcode":"hunter2","version":"1"}"#
        );
    }

    #[test]
    fn parses_connect_op() {
        let msg =
            SystemMessage::parse(br#"{"op":"CONNECT","cxId":"a:9:b","netId":3}"#).unwrap();
        assert_eq!(
            msg,
            SystemMessage::Connect {
                cx_id: "a:9:b".into(),
                net_id: Some(NetId(3)),
                owner_cx_id: None,
            }
        );
    }

    #[test]
    fn parses_net_id_and_migrate_owner_ops() {
        let msg = SystemMessage::parse(br#"{"op":"NET_ID","cxId":"a:9:b","netId":40}"#).unwrap();
        assert_eq!(msg, SystemMessage::NetId { cx_id: "a:9:b".into(), net_id: NetId::INVALID });

        let msg = SystemMessage::parse(br#"{"op":"MIGRATE_OWNER","cxId":"a:2:b"}"#).unwrap();
        assert_eq!(msg, SystemMessage::MigrateOwner { cx_id: "a:2:b".into() });
    }

    #[test]
    fn unrecognized_op_parses_as_unknown() {
        let msg = SystemMessage::parse(br#"{"op":"LOBBY_COUNTDOWN","seconds":5}"#).unwrap();
        assert_eq!(msg, SystemMessage::Unknown);
    }

    #[test]
    fn missing_op_is_an_error() {
        assert!(SystemMessage::parse(br#"{"cxId":"a:9:b"}"#).is_err());
        assert!(SystemMessage::parse(b"not json").is_err());
    }
}
