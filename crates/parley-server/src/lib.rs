// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Parley chat server
//!
//! Serves the session runtime from `parley-core` over a WebSocket endpoint
//! (`/ws`) with JSON text frames, plus `/healthz` and `/project/settings`.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod reload;
pub mod server;
pub mod state;
pub mod transport;

pub use auth::AuthConfig;
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use reload::ReloadBroadcaster;
pub use server::Server;
