// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fan-out of reload notices to every live socket

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct ReloadBroadcaster {
    tx: broadcast::Sender<()>,
}

impl ReloadBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Ask every connected client to reload. Returns the number of sockets
    /// notified.
    pub fn broadcast_reload(&self) -> usize {
        let notified = self.tx.send(()).unwrap_or(0);
        tracing::info!(notified, "Broadcasting reload");
        notified
    }
}

impl Default for ReloadBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
