// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session registry.
//!
//! Process-wide map of live sessions. The registry itself is plain data;
//! callers wrap it in a `tokio::sync::RwLock` so that capacity check and
//! insert happen as one atomic composite under the write lock.

use crate::server::session::TransferSession;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of live sessions, bounded by `max_sessions`.
pub struct SessionRegistry {
    sessions: HashMap<String, Arc<TransferSession>>,
    max_sessions: usize,
}

/// The registry is full and the requested session does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityExceeded;

impl std::fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Server at capacity")
    }
}

impl std::error::Error for CapacityExceeded {}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Return the existing session, or create and insert one if the
    /// registry has room.
    pub fn get_or_create(
        &mut self,
        session_id: &str,
    ) -> Result<Arc<TransferSession>, CapacityExceeded> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(session.clone());
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(CapacityExceeded);
        }
        let session = Arc::new(TransferSession::new(session_id));
        self.sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<TransferSession>> {
        self.sessions.get(session_id).cloned()
    }

    /// Remove a session. Idempotent: removing an absent id is a no-op.
    pub fn remove(&mut self, session_id: &str) -> Option<Arc<TransferSession>> {
        self.sessions.remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all live sessions.
    pub fn snapshot(&self) -> Vec<Arc<TransferSession>> {
        self.sessions.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_reuses_existing() {
        let mut reg = SessionRegistry::new(10);
        let a = reg.get_or_create("abc").unwrap();
        let b = reg.get_or_create("abc").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn capacity_rejects_only_new_sessions() {
        let mut reg = SessionRegistry::new(2);
        reg.get_or_create("a").unwrap();
        reg.get_or_create("b").unwrap();

        assert!(matches!(reg.get_or_create("c"), Err(CapacityExceeded)));
        // Existing ids still resolve at capacity.
        assert!(reg.get_or_create("a").is_ok());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = SessionRegistry::new(10);
        reg.get_or_create("abc").unwrap();

        assert!(reg.remove("abc").is_some());
        assert!(reg.remove("abc").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn removed_slot_frees_capacity() {
        let mut reg = SessionRegistry::new(1);
        reg.get_or_create("a").unwrap();
        assert!(reg.get_or_create("b").is_err());

        reg.remove("a");
        assert!(reg.get_or_create("b").is_ok());
    }

    #[test]
    fn snapshot_lists_live_sessions() {
        let mut reg = SessionRegistry::new(10);
        reg.get_or_create("a").unwrap();
        reg.get_or_create("b").unwrap();

        let ids: Vec<String> = reg
            .snapshot()
            .iter()
            .map(|s| s.session_id.clone())
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"b".to_string()));
    }
}
