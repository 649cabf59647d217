// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Role handlers: sender, receiver, and peer state machines.
//!
//! Each handler owns the read half of one connection and drives the
//! session through its lifecycle: rendezvous, relay, teardown. The session
//! lock is held across state transitions only; binary forwards happen
//! outside the lock, and control-frame forwards are enqueued non-blocking
//! under the lock so every recipient observes chat in insertion order.

use crate::config::ServerConfig;
use crate::server::endpoint::{EndpointError, EndpointHandle};
use crate::server::protocol::{ClientFrame, EventFrame, StatusFrame};
use crate::server::session::{PeerSlot, TransferSession};
use crate::server::{AppState, ServerError};
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::stream::SplitStream;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Granularity of the sender's rendezvous poll.
const RENDEZVOUS_POLL: Duration = Duration::from_secs(1);

/// Minimum spacing between `speed_update` frames to one producer.
const SPEED_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of the sender's wait for its receiver.
enum Rendezvous {
    Ready,
    TimedOut,
    SenderGone,
}

/// Send to the handler's own endpoint. `Ok(false)` means the endpoint is
/// already gone, which ends the handler the same way a read failure would.
async fn send_self<T: Serialize>(
    handle: &EndpointHandle,
    frame: &T,
) -> Result<bool, ServerError> {
    match handle.send_json(frame).await {
        Ok(()) => Ok(true),
        Err(EndpointError::Closed) => Ok(false),
        Err(e) => Err(ServerError::Internal(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Sender (legacy two-party mode)
// ---------------------------------------------------------------------------

pub(crate) async fn run_sender(
    state: &AppState,
    session: &Arc<TransferSession>,
    handle: &EndpointHandle,
    inbound: &mut SplitStream<WebSocket>,
    session_id: &str,
    user_id: &str,
) -> Result<(), ServerError> {
    {
        let mut st = session.lock().await;
        // The first attaching role locks the session's mode.
        if !st.peers.is_empty() {
            drop(st);
            send_self(handle, &StatusFrame::error("Session mode conflict")).await?;
            return Ok(());
        }
        st.sender = Some(handle.clone());
    }
    send_self(handle, &StatusFrame::waiting(session_id)).await?;

    match await_receiver(state, session, inbound).await {
        Rendezvous::Ready => {}
        Rendezvous::TimedOut => {
            debug!(session_id, "Receiver timeout, dropping session");
            send_self(handle, &StatusFrame::error("Receiver timeout")).await?;
            state.remove_session(session_id).await;
            return Ok(());
        }
        Rendezvous::SenderGone => {
            state.remove_session(session_id).await;
            return Ok(());
        }
    }

    info!(session_id, "Receiver connected, transfer ready");
    let chat_history = {
        let mut st = session.lock().await;
        st.is_active = true;
        st.start_time = Some(Instant::now());
        st.chat_history()
    };
    send_self(handle, &StatusFrame::ready(chat_history)).await?;

    let result = relay_from_sender(&state.config, session, handle, inbound).await;

    // The sender drives the session's lifetime: finalize, flush the
    // receiver, drop the session. All sends are best-effort here.
    let receiver = {
        let mut st = session.lock().await;
        st.is_active = false;
        st.end_time = Some(Utc::now());
        st.receiver.clone()
    };
    if let Some(rx) = receiver {
        let _ = rx.send_json(&EventFrame::TransferComplete).await;
        rx.close();
    }
    state.remove_session(session_id).await;
    info!(session_id, user_id, "Sender disconnected, session closed");
    result
}

/// Poll for the receiver at 1 s granularity while servicing the sender's
/// socket: control frames dispatch as usual (a chat sent now must be in
/// the history handed to the receiver), binary frames are dropped because
/// the relay has not started, and a disconnect tears down immediately.
async fn await_receiver(
    state: &AppState,
    session: &Arc<TransferSession>,
    inbound: &mut SplitStream<WebSocket>,
) -> Rendezvous {
    let deadline = Instant::now() + state.config.receiver_wait();
    loop {
        {
            let mut st = session.lock().await;
            if st.receiver.is_some() {
                return Rendezvous::Ready;
            }
            st.update_activity();
        }
        if Instant::now() >= deadline {
            return Rendezvous::TimedOut;
        }

        tokio::select! {
            _ = tokio::time::sleep(RENDEZVOUS_POLL) => {}
            frame = inbound.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch_sender_control(&state.config, session, &text).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Dropping binary frame sent before rendezvous");
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Rendezvous::SenderGone;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn relay_from_sender(
    config: &ServerConfig,
    session: &Arc<TransferSession>,
    handle: &EndpointHandle,
    inbound: &mut SplitStream<WebSocket>,
) -> Result<(), ServerError> {
    let mut last_speed_update = Instant::now();

    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                dispatch_sender_control(config, session, &text).await;
            }
            Ok(Message::Binary(chunk)) => {
                let (receiver, dropped) = {
                    let mut st = session.lock().await;
                    st.update_activity();
                    if st.paused {
                        (None, true)
                    } else {
                        st.bytes_transferred += chunk.len() as u64;
                        (st.receiver.clone(), false)
                    }
                };
                if dropped {
                    continue;
                }
                if let Some(rx) = receiver {
                    let _ = rx.send_binary(chunk).await;
                }
                if last_speed_update.elapsed() > SPEED_UPDATE_INTERVAL {
                    let (speed, bytes_transferred) = {
                        let st = session.lock().await;
                        (st.calculate_speed(), st.bytes_transferred)
                    };
                    send_self(
                        handle,
                        &EventFrame::SpeedUpdate {
                            speed,
                            bytes_transferred,
                        },
                    )
                    .await?;
                    last_speed_update = Instant::now();
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    Ok(())
}

/// Dispatch one text frame from the sender. Malformed or unrecognized
/// frames are dropped; the handler keeps going.
async fn dispatch_sender_control(
    config: &ServerConfig,
    session: &Arc<TransferSession>,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Dropping malformed control frame: {}", e);
            return;
        }
    };

    let mut st = session.lock().await;
    st.update_activity();
    match frame {
        ClientFrame::Chat { message } => {
            let entry = st.add_message("sender", message, config.max_message_length);
            if let Some(rx) = &st.receiver {
                let _ = rx.try_send_json(&EventFrame::Chat { data: entry });
            }
        }
        ClientFrame::Typing => {
            if let Some(rx) = &st.receiver {
                let _ = rx.try_send_json(&EventFrame::Typing {
                    sender: "sender".to_string(),
                });
            }
        }
        ClientFrame::Pause => {
            st.paused = true;
            if let Some(rx) = &st.receiver {
                let _ = rx.try_send_json(&EventFrame::Paused);
            }
        }
        ClientFrame::Resume => {
            st.paused = false;
            if let Some(rx) = &st.receiver {
                let _ = rx.try_send_json(&EventFrame::Resumed);
            }
        }
        ClientFrame::Pong => {}
    }
}

// ---------------------------------------------------------------------------
// Receiver (legacy two-party mode)
// ---------------------------------------------------------------------------

pub(crate) async fn run_receiver(
    state: &AppState,
    session: &Arc<TransferSession>,
    handle: &EndpointHandle,
    inbound: &mut SplitStream<WebSocket>,
    user_id: &str,
) -> Result<(), ServerError> {
    let (metadata, chat_history, sender) = {
        let mut st = session.lock().await;
        if !st.peers.is_empty() {
            drop(st);
            send_self(handle, &StatusFrame::error("Session mode conflict")).await?;
            return Ok(());
        }
        st.receiver = Some(handle.clone());
        st.update_activity();
        (st.metadata.clone(), st.chat_history(), st.sender.clone())
    };
    send_self(
        handle,
        &StatusFrame::receiver_connected(metadata, chat_history),
    )
    .await?;
    if let Some(tx) = sender {
        let _ = tx.send_json(&StatusFrame::sender_notified()).await;
    }

    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                dispatch_receiver_control(&state.config, session, &text).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // The receiver does not produce payload; anything binary from
            // this side is ignored.
            Ok(_) => {}
        }
    }

    // The sender handler owns session removal; just detach.
    session.lock().await.receiver = None;
    info!(session_id = %session.session_id, user_id, "Receiver disconnected");
    Ok(())
}

async fn dispatch_receiver_control(
    config: &ServerConfig,
    session: &Arc<TransferSession>,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Dropping malformed control frame: {}", e);
            return;
        }
    };

    let mut st = session.lock().await;
    st.update_activity();
    match frame {
        ClientFrame::Chat { message } => {
            let entry = st.add_message("receiver", message, config.max_message_length);
            if let Some(tx) = &st.sender {
                let _ = tx.try_send_json(&EventFrame::Chat { data: entry });
            }
        }
        ClientFrame::Typing => {
            if let Some(tx) = &st.sender {
                let _ = tx.try_send_json(&EventFrame::Typing {
                    sender: "receiver".to_string(),
                });
            }
        }
        ClientFrame::Pong => {}
        // Flow control belongs to the sender side.
        ClientFrame::Pause | ClientFrame::Resume => {}
    }
}

// ---------------------------------------------------------------------------
// Peer (N-party mode)
// ---------------------------------------------------------------------------

pub(crate) async fn run_peer(
    state: &AppState,
    session: &Arc<TransferSession>,
    handle: &EndpointHandle,
    inbound: &mut SplitStream<WebSocket>,
    session_id: &str,
    user_id: &str,
    conn_id: &str,
) -> Result<(), ServerError> {
    let (chat_history, peer_count, others) = {
        let mut st = session.lock().await;
        if st.sender.is_some() || st.receiver.is_some() {
            drop(st);
            send_self(handle, &StatusFrame::error("Session mode conflict")).await?;
            return Ok(());
        }
        st.peers.push(PeerSlot {
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
            handle: handle.clone(),
        });
        st.update_activity();
        st.is_active = true;
        if st.peers.len() == 1 {
            st.start_time = Some(Instant::now());
        }
        (
            st.chat_history(),
            st.peers.len(),
            st.peer_handles_except(conn_id),
        )
    };
    send_self(
        handle,
        &StatusFrame::peer_connected(user_id, peer_count, chat_history),
    )
    .await?;
    for other in &others {
        let _ = other.try_send_json(&StatusFrame::peer_joined());
    }
    info!(session_id, user_id, peer_count, "Peer connected");

    let mut last_speed_update = Instant::now();
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                dispatch_peer_control(&state.config, session, user_id, conn_id, &text).await;
            }
            Ok(Message::Binary(chunk)) => {
                let (targets, dropped) = {
                    let mut st = session.lock().await;
                    st.update_activity();
                    if st.paused {
                        (Vec::new(), true)
                    } else {
                        st.bytes_transferred += chunk.len() as u64;
                        (st.peer_handles_except(conn_id), false)
                    }
                };
                if dropped {
                    continue;
                }
                for target in &targets {
                    let _ = target.send_binary(chunk.clone()).await;
                }
                if last_speed_update.elapsed() > SPEED_UPDATE_INTERVAL {
                    let (speed, bytes_transferred) = {
                        let st = session.lock().await;
                        (st.calculate_speed(), st.bytes_transferred)
                    };
                    send_self(
                        handle,
                        &EventFrame::SpeedUpdate {
                            speed,
                            bytes_transferred,
                        },
                    )
                    .await?;
                    last_speed_update = Instant::now();
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Detach; the last peer out removes the session.
    let (remaining, others) = {
        let mut st = session.lock().await;
        st.peers.retain(|p| p.conn_id != conn_id);
        let others = st.peer_handles_except(conn_id);
        if st.peers.is_empty() {
            st.is_active = false;
            st.end_time = Some(Utc::now());
        }
        (st.peers.len(), others)
    };
    for other in &others {
        let _ = other.try_send_json(&EventFrame::peer_left());
    }
    if remaining == 0 {
        state.remove_session(session_id).await;
    }
    info!(session_id, user_id, remaining, "Peer disconnected");
    Ok(())
}

async fn dispatch_peer_control(
    config: &ServerConfig,
    session: &Arc<TransferSession>,
    user_id: &str,
    conn_id: &str,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Dropping malformed control frame: {}", e);
            return;
        }
    };

    let mut st = session.lock().await;
    st.update_activity();
    match frame {
        ClientFrame::Chat { message } => {
            let entry = st.add_message(user_id, message, config.max_message_length);
            for other in st.peer_handles_except(conn_id) {
                let _ = other.try_send_json(&EventFrame::Chat {
                    data: entry.clone(),
                });
            }
        }
        ClientFrame::Pong => {}
        // Typing indicators and flow control are two-party concerns.
        ClientFrame::Typing | ClientFrame::Pause | ClientFrame::Resume => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_config() -> ServerConfig {
        ServerConfig {
            max_message_length: 10,
            ..Default::default()
        }
    }

    fn test_handle() -> (EndpointHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (EndpointHandle::from_channel(tx), rx)
    }

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(text) => text,
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sender_chat_is_logged_and_forwarded() {
        let config = test_config();
        let session = Arc::new(TransferSession::new("s"));
        let (receiver, mut rx) = test_handle();
        session.lock().await.receiver = Some(receiver);

        dispatch_sender_control(&config, &session, r#"{"type":"chat","message":"hi"}"#).await;

        let st = session.lock().await;
        assert_eq!(st.chat_history().len(), 1);
        assert_eq!(st.chat_history()[0].sender, "sender");
        drop(st);

        let forwarded = text_of(rx.try_recv().unwrap());
        assert!(forwarded.contains(r#""type":"chat""#));
        assert!(forwarded.contains(r#""message":"hi""#));
    }

    #[tokio::test]
    async fn sender_chat_without_receiver_still_logged() {
        let config = test_config();
        let session = Arc::new(TransferSession::new("s"));

        dispatch_sender_control(&config, &session, r#"{"type":"chat","message":"hi"}"#).await;

        assert_eq!(session.lock().await.chat_history().len(), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_and_forward() {
        let config = test_config();
        let session = Arc::new(TransferSession::new("s"));
        let (receiver, mut rx) = test_handle();
        session.lock().await.receiver = Some(receiver);

        dispatch_sender_control(&config, &session, r#"{"type":"pause"}"#).await;
        assert!(session.lock().await.paused);
        assert_eq!(text_of(rx.try_recv().unwrap()), r#"{"type":"paused"}"#);

        dispatch_sender_control(&config, &session, r#"{"type":"resume"}"#).await;
        assert!(!session.lock().await.paused);
        assert_eq!(text_of(rx.try_recv().unwrap()), r#"{"type":"resumed"}"#);
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_dropped() {
        let config = test_config();
        let session = Arc::new(TransferSession::new("s"));

        dispatch_sender_control(&config, &session, "not json").await;
        dispatch_sender_control(&config, &session, r#"{"type":"subscribe"}"#).await;
        dispatch_receiver_control(&config, &session, r#"{"what":"ever"}"#).await;

        let st = session.lock().await;
        assert_eq!(st.chat_history().len(), 0);
        assert!(!st.paused);
    }

    #[tokio::test]
    async fn receiver_chat_goes_to_sender() {
        let config = test_config();
        let session = Arc::new(TransferSession::new("s"));
        let (sender, mut rx) = test_handle();
        session.lock().await.sender = Some(sender);

        dispatch_receiver_control(&config, &session, r#"{"type":"chat","message":"yo"}"#).await;

        let forwarded = text_of(rx.try_recv().unwrap());
        assert!(forwarded.contains(r#""sender":"receiver""#));
        assert!(forwarded.contains(r#""message":"yo""#));
    }

    #[tokio::test]
    async fn receiver_pause_is_ignored() {
        let config = test_config();
        let session = Arc::new(TransferSession::new("s"));

        dispatch_receiver_control(&config, &session, r#"{"type":"pause"}"#).await;
        assert!(!session.lock().await.paused);
    }

    #[tokio::test]
    async fn peer_chat_broadcast_excludes_the_source() {
        let config = test_config();
        let session = Arc::new(TransferSession::new("p"));
        let (ha, mut rx_a) = test_handle();
        let (hb, mut rx_b) = test_handle();
        let (hc, mut rx_c) = test_handle();
        {
            let mut st = session.lock().await;
            for (user, conn, handle) in [("a", "c1", ha), ("b", "c2", hb), ("c", "c3", hc)] {
                st.peers.push(PeerSlot {
                    user_id: user.into(),
                    conn_id: conn.into(),
                    handle,
                });
            }
        }

        dispatch_peer_control(&config, &session, "c", "c3", r#"{"type":"chat","message":"g"}"#)
            .await;

        assert!(text_of(rx_a.try_recv().unwrap()).contains(r#""sender":"c""#));
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn chat_truncation_applies_config_limit() {
        let config = test_config(); // max_message_length = 10
        let session = Arc::new(TransferSession::new("s"));

        dispatch_sender_control(
            &config,
            &session,
            r#"{"type":"chat","message":"0123456789abcdef"}"#,
        )
        .await;

        assert_eq!(session.lock().await.chat_history()[0].message, "0123456789");
    }
}
