// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-transfer session state.
//!
//! A [`TransferSession`] is the rendezvous bucket shared by every endpoint
//! of one transfer. All fields mutated by concurrent role handlers live in
//! [`SessionState`] behind one async mutex; handlers hold the lock across
//! state transitions only, never across socket I/O.

use crate::server::endpoint::EndpointHandle;
use crate::server::protocol::{now_timestamp, ChatEntry};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};

/// Chat log cap; oldest entries are evicted beyond this.
pub const MAX_CHAT_HISTORY: usize = 100;

/// One attached peer-mode endpoint.
pub struct PeerSlot {
    pub user_id: String,
    /// Unique per-connection id; identity for removal and broadcast
    /// exclusion, so two connections sharing a user id stay independent.
    pub conn_id: String,
    pub handle: EndpointHandle,
}

/// Mutable session state, guarded by the per-session mutex.
pub struct SessionState {
    /// Caller-provided metadata, immutable after creation
    pub metadata: serde_json::Value,
    /// Attached sender endpoint (legacy two-party mode)
    pub sender: Option<EndpointHandle>,
    /// Attached receiver endpoint (legacy two-party mode)
    pub receiver: Option<EndpointHandle>,
    /// Attached peers (N-party mode); never populated together with the
    /// sender/receiver slots
    pub peers: Vec<PeerSlot>,
    /// Total forwarded payload bytes, monotonic
    pub bytes_transferred: u64,
    pub is_active: bool,
    /// While set, binary frames are dropped; control and chat still flow
    pub paused: bool,
    pub start_time: Option<Instant>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_activity: Instant,
    messages: VecDeque<ChatEntry>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            sender: None,
            receiver: None,
            peers: Vec::new(),
            bytes_transferred: 0,
            is_active: false,
            paused: false,
            start_time: None,
            end_time: None,
            last_activity: Instant::now(),
            messages: VecDeque::new(),
        }
    }

    /// Refresh the idle clock.
    pub fn update_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Idle age as seen by the sweeper.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Session-wide average throughput in bytes per second.
    ///
    /// Wall-clock average since the transfer became active; no moving
    /// window.
    pub fn calculate_speed(&self) -> f64 {
        match self.start_time {
            Some(start) if self.bytes_transferred > 0 => {
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    self.bytes_transferred as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Append a chat message, truncated to `max_len` characters, and
    /// return the stored entry.
    pub fn add_message(&mut self, sender: &str, text: String, max_len: usize) -> ChatEntry {
        let message = match text.char_indices().nth(max_len) {
            Some((idx, _)) => text[..idx].to_string(),
            None => text,
        };
        let entry = ChatEntry {
            sender: sender.to_string(),
            message,
            timestamp: now_timestamp(),
        };
        self.messages.push_back(entry.clone());
        while self.messages.len() > MAX_CHAT_HISTORY {
            self.messages.pop_front();
        }
        entry
    }

    /// Snapshot of the chat log, oldest first.
    pub fn chat_history(&self) -> Vec<ChatEntry> {
        self.messages.iter().cloned().collect()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Handles of every peer except the given connection.
    pub fn peer_handles_except(&self, conn_id: &str) -> Vec<EndpointHandle> {
        self.peers
            .iter()
            .filter(|p| p.conn_id != conn_id)
            .map(|p| p.handle.clone())
            .collect()
    }

    /// Every attached endpoint handle, regardless of mode.
    pub fn attached_handles(&self) -> Vec<EndpointHandle> {
        let mut handles: Vec<EndpointHandle> = Vec::new();
        if let Some(h) = &self.sender {
            handles.push(h.clone());
        }
        if let Some(h) = &self.receiver {
            handles.push(h.clone());
        }
        handles.extend(self.peers.iter().map(|p| p.handle.clone()));
        handles
    }
}

/// A named rendezvous bucket holding the state for one transfer.
pub struct TransferSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl TransferSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState::new()),
        }
    }

    /// Lock the mutable state. Hold across state transitions only.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Refresh the idle clock.
    pub async fn touch(&self) {
        self.state.lock().await.update_activity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_handle() -> (EndpointHandle, mpsc::Receiver<axum::extract::ws::Message>) {
        let (tx, rx) = mpsc::channel(8);
        (EndpointHandle::from_channel(tx), rx)
    }

    #[tokio::test]
    async fn add_message_truncates_on_characters() {
        let session = TransferSession::new("s");
        let mut st = session.lock().await;

        let entry = st.add_message("sender", "héllo wörld".to_string(), 5);
        assert_eq!(entry.message, "héllo");
        assert_eq!(entry.sender, "sender");
        assert!(entry.timestamp.ends_with('Z'));
    }

    #[tokio::test]
    async fn add_message_keeps_short_text_intact() {
        let session = TransferSession::new("s");
        let mut st = session.lock().await;

        let entry = st.add_message("u1", "short".to_string(), 5000);
        assert_eq!(entry.message, "short");
    }

    #[tokio::test]
    async fn chat_log_caps_at_100_oldest_first() {
        let session = TransferSession::new("s");
        let mut st = session.lock().await;

        for i in 0..105 {
            st.add_message("sender", format!("msg {}", i), 5000);
        }

        assert_eq!(st.message_count(), MAX_CHAT_HISTORY);
        let history = st.chat_history();
        assert_eq!(history.first().unwrap().message, "msg 5");
        assert_eq!(history.last().unwrap().message, "msg 104");
    }

    #[tokio::test]
    async fn speed_is_zero_before_start_or_bytes() {
        let session = TransferSession::new("s");
        let mut st = session.lock().await;

        assert_eq!(st.calculate_speed(), 0.0);

        st.start_time = Some(Instant::now());
        assert_eq!(st.calculate_speed(), 0.0);
    }

    #[tokio::test]
    async fn speed_is_bytes_over_elapsed() {
        let session = TransferSession::new("s");
        let mut st = session.lock().await;

        st.start_time = Some(Instant::now() - Duration::from_secs(2));
        st.bytes_transferred = 2048;

        let speed = st.calculate_speed();
        assert!(speed > 900.0 && speed < 1100.0, "speed was {}", speed);
    }

    #[tokio::test]
    async fn idle_age_tracks_backdated_activity() {
        let session = TransferSession::new("s");
        let mut st = session.lock().await;

        st.last_activity = Instant::now() - Duration::from_secs(100);
        assert!(st.idle_for() > Duration::from_secs(99));

        st.update_activity();
        assert!(st.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn peer_handles_exclude_by_connection_id() {
        let session = TransferSession::new("s");
        let mut st = session.lock().await;

        let (h1, _rx1) = test_handle();
        let (h2, _rx2) = test_handle();
        st.peers.push(PeerSlot {
            user_id: "alice".into(),
            conn_id: "c1".into(),
            handle: h1,
        });
        st.peers.push(PeerSlot {
            user_id: "alice".into(),
            conn_id: "c2".into(),
            handle: h2,
        });

        assert_eq!(st.peer_handles_except("c1").len(), 1);
        assert_eq!(st.peer_handles_except("c3").len(), 2);
    }

    #[tokio::test]
    async fn attached_handles_cover_both_modes() {
        let session = TransferSession::new("s");
        let mut st = session.lock().await;
        assert!(st.attached_handles().is_empty());

        let (h1, _rx1) = test_handle();
        let (h2, _rx2) = test_handle();
        st.sender = Some(h1);
        st.receiver = Some(h2);
        assert_eq!(st.attached_handles().len(), 2);
    }
}
