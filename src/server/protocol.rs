// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WebSocket wire protocol for the transfer relay.
//!
//! Text frames carry JSON. Inbound frames are tagged by `type`; outbound
//! frames are tagged by `status` (lifecycle) or `type` (relayed events and
//! telemetry). Binary frames are opaque payload and never touch this
//! module.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Client → Server control frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Chat message for the session log
    Chat {
        #[serde(default)]
        message: String,
    },

    /// Typing indicator
    Typing,

    /// Suppress binary forwarding
    Pause,

    /// Resume binary forwarding
    Resume,

    /// Heartbeat reply
    Pong,
}

/// Server → Client lifecycle frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusFrame {
    /// Sender attached, no receiver yet
    Waiting {
        message: String,
        session_id: String,
        timestamp: String,
    },

    /// Receiver attached; transfer may start
    Ready {
        message: String,
        timestamp: String,
        chat_history: Vec<ChatEntry>,
    },

    /// Sent to a freshly attached receiver or peer
    Connected {
        message: String,
        timestamp: String,
        chat_history: Vec<ChatEntry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_count: Option<usize>,
    },

    /// Notifies a waiting sender that its receiver arrived
    ReceiverConnected { message: String, timestamp: String },

    /// Broadcast to existing peers when another peer attaches
    PeerJoined { message: String, timestamp: String },

    /// Terminal error, followed by close
    Error { message: String },
}

/// Server → Client event and telemetry frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventFrame {
    /// Relayed chat entry
    Chat { data: ChatEntry },

    /// Relayed typing indicator
    Typing { sender: String },

    /// Binary forwarding suppressed
    Paused,

    /// Binary forwarding resumed
    Resumed,

    /// The sender disconnected; the transfer is over
    TransferComplete,

    /// A peer left the session
    PeerLeft { message: String, timestamp: String },

    /// Liveness probe
    Ping,

    /// Throughput telemetry, at most once per second
    SpeedUpdate { speed: f64, bytes_transferred: u64 },
}

/// One entry of a session's chat log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub sender: String,
    pub message: String,
    pub timestamp: String,
}

/// Current wall-clock time as ISO-8601 UTC with a trailing `Z`.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl StatusFrame {
    pub fn waiting(session_id: impl Into<String>) -> Self {
        Self::Waiting {
            message: "Waiting for receiver...".to_string(),
            session_id: session_id.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn ready(chat_history: Vec<ChatEntry>) -> Self {
        Self::Ready {
            message: "Receiver connected. Ready to transfer.".to_string(),
            timestamp: now_timestamp(),
            chat_history,
        }
    }

    pub fn receiver_connected(
        metadata: serde_json::Value,
        chat_history: Vec<ChatEntry>,
    ) -> Self {
        Self::Connected {
            message: "Connected to sender".to_string(),
            timestamp: now_timestamp(),
            chat_history,
            metadata: Some(metadata),
            user_id: None,
            peer_count: None,
        }
    }

    pub fn peer_connected(
        user_id: impl Into<String>,
        peer_count: usize,
        chat_history: Vec<ChatEntry>,
    ) -> Self {
        Self::Connected {
            message: format!("Connected to session. {} peer(s) in session.", peer_count),
            timestamp: now_timestamp(),
            chat_history,
            metadata: None,
            user_id: Some(user_id.into()),
            peer_count: Some(peer_count),
        }
    }

    pub fn sender_notified() -> Self {
        Self::ReceiverConnected {
            message: "Receiver connected".to_string(),
            timestamp: now_timestamp(),
        }
    }

    pub fn peer_joined() -> Self {
        Self::PeerJoined {
            message: "Another peer joined the session".to_string(),
            timestamp: now_timestamp(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl EventFrame {
    pub fn peer_left() -> Self {
        Self::PeerLeft {
            message: "A peer left the session".to_string(),
            timestamp: now_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chat() {
        let json = r#"{"type": "chat", "message": "hello"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Chat { message } => assert_eq!(message, "hello"),
            _ => panic!("Expected Chat"),
        }
    }

    #[test]
    fn parse_chat_without_message_defaults_empty() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type": "chat"}"#).unwrap();
        match frame {
            ClientFrame::Chat { message } => assert_eq!(message, ""),
            _ => panic!("Expected Chat"),
        }
    }

    #[test]
    fn parse_unit_controls() {
        for (json, expect_pause) in [
            (r#"{"type": "pause"}"#, true),
            (r#"{"type": "resume"}"#, false),
        ] {
            let frame: ClientFrame = serde_json::from_str(json).unwrap();
            match (frame, expect_pause) {
                (ClientFrame::Pause, true) | (ClientFrame::Resume, false) => {}
                other => panic!("Unexpected parse: {:?}", other),
            }
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type": "subscribe"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
    }

    #[test]
    fn serialize_status_tags() {
        let json = serde_json::to_string(&StatusFrame::waiting("abc")).unwrap();
        assert!(json.contains(r#""status":"waiting""#));
        assert!(json.contains(r#""session_id":"abc""#));

        let json = serde_json::to_string(&StatusFrame::error("Server at capacity")).unwrap();
        assert!(json.contains(r#""status":"error""#));
        assert!(json.contains("Server at capacity"));
    }

    #[test]
    fn serialize_connected_skips_absent_fields() {
        let json =
            serde_json::to_string(&StatusFrame::receiver_connected(serde_json::json!({}), vec![]))
                .unwrap();
        assert!(json.contains(r#""status":"connected""#));
        assert!(json.contains("metadata"));
        assert!(!json.contains("peer_count"));

        let json = serde_json::to_string(&StatusFrame::peer_connected("u1", 2, vec![])).unwrap();
        assert!(json.contains(r#""peer_count":2"#));
        assert!(!json.contains("metadata"));
    }

    #[test]
    fn serialize_event_tags() {
        let json = serde_json::to_string(&EventFrame::SpeedUpdate {
            speed: 1024.0,
            bytes_transferred: 2048,
        })
        .unwrap();
        assert!(json.contains(r#""type":"speed_update""#));
        assert!(json.contains(r#""bytes_transferred":2048"#));

        let json = serde_json::to_string(&EventFrame::TransferComplete).unwrap();
        assert_eq!(json, r#"{"type":"transfer_complete"}"#);
    }

    #[test]
    fn timestamp_is_utc_with_z_suffix() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'), "timestamp {} should end with Z", ts);
    }
}
