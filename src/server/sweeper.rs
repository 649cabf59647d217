// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background maintenance tasks.
//!
//! The sweeper evicts sessions whose idle age exceeds the configured
//! timeout; eviction is idempotent with respect to handlers tearing down
//! concurrently, and endpoint closes are best-effort. The heartbeat task,
//! when enabled, probes every attached endpoint so dead peers surface as
//! missing `pong` activity.

use crate::server::protocol::EventFrame;
use crate::server::AppState;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawn the idle-session sweeper. Stops on shutdown notification.
pub fn spawn_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = state.config.sweep_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let evicted = sweep_idle_sessions(&state).await;
                    if evicted > 0 {
                        info!("Evicted {} idle session(s)", evicted);
                    }
                }
                _ = state.shutdown.notified() => {
                    debug!("Sweeper shutting down");
                    break;
                }
            }
        }
    })
}

/// One sweep pass: snapshot the registry, drop sessions idle beyond the
/// timeout, close whatever endpoints they still hold. Returns the number
/// of sessions evicted.
pub async fn sweep_idle_sessions(state: &AppState) -> usize {
    let timeout = state.config.session_timeout();
    let snapshot = state.registry.read().await.snapshot();

    let mut stale = Vec::new();
    for session in snapshot {
        let st = session.lock().await;
        if st.idle_for() > timeout {
            stale.push((session.session_id.clone(), st.attached_handles()));
        }
    }

    let mut evicted = 0;
    for (session_id, handles) in stale {
        info!(session_id = %session_id, "Cleaning up stale session");
        if state.registry.write().await.remove(&session_id).is_some() {
            evicted += 1;
        }
        for handle in handles {
            handle.close();
        }
    }
    evicted
}

/// Spawn the heartbeat task, if a ping interval is configured.
pub fn spawn_heartbeat(state: Arc<AppState>) -> Option<JoinHandle<()>> {
    let interval = state.config.ping_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let snapshot = state.registry.read().await.snapshot();
                    for session in snapshot {
                        let handles = session.lock().await.attached_handles();
                        for handle in handles {
                            let _ = handle.try_send_json(&EventFrame::Ping);
                        }
                    }
                }
                _ = state.shutdown.notified() => {
                    debug!("Heartbeat shutting down");
                    break;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::endpoint::EndpointHandle;
    use axum::extract::ws::Message;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn test_state(timeout_secs: u64) -> AppState {
        AppState::new(ServerConfig {
            session_timeout_secs: timeout_secs,
            ping_interval_secs: 0,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_sessions() {
        let state = test_state(30);
        let stale = state.registry.write().await.get_or_create("stale").unwrap();
        state.registry.write().await.get_or_create("fresh").unwrap();

        stale.lock().await.last_activity = Instant::now() - Duration::from_secs(100);

        let evicted = sweep_idle_sessions(&state).await;

        assert_eq!(evicted, 1);
        let reg = state.registry.read().await;
        assert!(reg.get("stale").is_none());
        assert!(reg.get("fresh").is_some());
    }

    #[tokio::test]
    async fn sweep_closes_attached_endpoints() {
        let state = test_state(30);
        let session = state.registry.write().await.get_or_create("s").unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        {
            let mut st = session.lock().await;
            st.sender = Some(EndpointHandle::from_channel(tx));
            st.last_activity = Instant::now() - Duration::from_secs(100);
        }

        sweep_idle_sessions(&state).await;

        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn sweep_is_idempotent_with_concurrent_removal() {
        let state = test_state(30);
        let session = state.registry.write().await.get_or_create("s").unwrap();
        session.lock().await.last_activity = Instant::now() - Duration::from_secs(100);

        // A handler tears the session down between snapshot and removal.
        state.remove_session("s").await;

        let evicted = sweep_idle_sessions(&state).await;
        assert_eq!(evicted, 0);
    }

    #[tokio::test]
    async fn heartbeat_disabled_without_interval() {
        let state = Arc::new(test_state(30));
        assert!(spawn_heartbeat(state).is_none());
    }
}
