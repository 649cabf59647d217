// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint write half.
//!
//! Every accepted WebSocket is split; the sink is owned by a writer task
//! draining a bounded channel, and an [`EndpointHandle`] (cloneable sender
//! into that channel) is the only way the rest of the server writes to the
//! connection. Concurrent producers are serialized by the channel, and a
//! single producer's frames are delivered in the order it enqueued them.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound queue depth per endpoint. Binary producers block (backpressure)
/// when the peer drains slowly; control frames fall back to best-effort.
const OUTBOUND_QUEUE: usize = 64;

/// Handle for writing to one connected endpoint.
#[derive(Clone)]
pub struct EndpointHandle {
    tx: mpsc::Sender<Message>,
}

/// Endpoint write errors.
#[derive(Debug)]
pub enum EndpointError {
    /// The endpoint's writer task is gone (connection closed).
    Closed,
    /// Outbound frame could not be serialized.
    Serialize(String),
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Endpoint closed"),
            Self::Serialize(s) => write!(f, "Serialize error: {}", s),
        }
    }
}

impl std::error::Error for EndpointError {}

impl EndpointHandle {
    /// Take ownership of a WebSocket sink and spawn its writer task.
    pub fn spawn_writer(mut sink: SplitSink<WebSocket, Message>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() {
                    debug!("Endpoint write failed, stopping writer");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        Self { tx }
    }

    /// Build a handle backed by a bare channel. Used by tests to observe
    /// exactly what a role handler would have written to the socket.
    pub fn from_channel(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Send a JSON frame, waiting for queue space.
    pub async fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), EndpointError> {
        let json =
            serde_json::to_string(frame).map_err(|e| EndpointError::Serialize(e.to_string()))?;
        self.tx
            .send(Message::Text(json))
            .await
            .map_err(|_| EndpointError::Closed)
    }

    /// Enqueue a JSON frame without waiting.
    ///
    /// Used for forwards performed while a session lock is held; a full
    /// queue drops the frame (the slow endpoint's own handler will observe
    /// the problem and clean up).
    pub fn try_send_json<T: Serialize>(&self, frame: &T) -> Result<(), EndpointError> {
        let json =
            serde_json::to_string(frame).map_err(|e| EndpointError::Serialize(e.to_string()))?;
        self.tx
            .try_send(Message::Text(json))
            .map_err(|_| EndpointError::Closed)
    }

    /// Forward an opaque binary payload, waiting for queue space.
    pub async fn send_binary(&self, payload: Vec<u8>) -> Result<(), EndpointError> {
        self.tx
            .send(Message::Binary(payload))
            .await
            .map_err(|_| EndpointError::Closed)
    }

    /// Request a close of the underlying connection. Best-effort: a full
    /// queue or an already-gone writer is fine.
    pub fn close(&self) {
        let _ = self.tx.try_send(Message::Close(None));
    }
}
