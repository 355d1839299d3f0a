// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Identity attached to a session at creation time

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Authenticated user information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Stable identifier presented by the identity provider
    pub identifier: String,

    /// Id of the user's record in the persistence backend, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_id: Option<String>,

    #[serde(default = "default_role")]
    pub role: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

fn default_role() -> String {
    "USER".to_string()
}

impl User {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            persisted_id: None,
            role: default_role(),
            tags: Vec::new(),
            provider: None,
        }
    }
}

/// Resolves the identity behind a connection's authorization header.
///
/// Any error refuses the connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, authorization: Option<&str>) -> anyhow::Result<User>;
}
