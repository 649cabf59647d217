// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-user concurrent-connection throttle.
//!
//! Every accepted connection acquires a slot keyed by `user_id` before any
//! session work happens, and the connection handler releases it on every
//! exit path. Check and increment are atomic per key (DashMap entry guard).

use dashmap::DashMap;

/// Concurrent-connection counter with a per-user ceiling.
pub struct ConnectionThrottle {
    counts: DashMap<String, usize>,
    max_per_user: usize,
}

impl ConnectionThrottle {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            counts: DashMap::new(),
            max_per_user,
        }
    }

    /// Claim a slot for `user_id`. Returns false when the user is already
    /// at the ceiling.
    pub fn try_acquire(&self, user_id: &str) -> bool {
        let mut entry = self.counts.entry(user_id.to_string()).or_insert(0);
        if *entry >= self.max_per_user {
            return false;
        }
        *entry += 1;
        true
    }

    /// Give back a slot. Never drops below zero; drained entries are
    /// removed so the table stays bounded by live users.
    pub fn release(&self, user_id: &str) {
        let drained = match self.counts.get_mut(user_id) {
            Some(mut entry) => {
                *entry = entry.saturating_sub(1);
                *entry == 0
            }
            None => false,
        };
        if drained {
            self.counts.remove_if(user_id, |_, count| *count == 0);
        }
    }

    /// Current count for a user (0 when unknown).
    pub fn count(&self, user_id: &str) -> usize {
        self.counts.get(user_id).map(|e| *e).unwrap_or(0)
    }
}
