// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transfer relay library.
//!
//! A stateful WebSocket switch that forwards opaque binary payloads and
//! chat/control messages between endpoints that cannot reach each other
//! directly. Endpoints attach to a named session in a role (`sender`,
//! `receiver`, or `peer`); the relay never inspects payload bytes.
//!
//! The binary target wires this library to a CLI and a listener; tests
//! drive [`server::build_router`] on ephemeral ports.

pub mod config;
pub mod server;

pub use config::ServerConfig;
pub use server::{build_router, AppState};
