// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Server state management

use crate::auth::AuthConfig;
use crate::reload::ReloadBroadcaster;
use parley_core::Dispatcher;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,

    /// Credentials checked by the plain HTTP routes
    pub auth: AuthConfig,

    pub reload: ReloadBroadcaster,

    /// One permit per open socket
    pub permits: Arc<Semaphore>,
}
