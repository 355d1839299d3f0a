// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Server configuration

use crate::error::{ServerError, ServerResult};
use parley_core::ProjectConfig;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

/// Default cap on concurrently open sockets.
pub const DEFAULT_CONNECTION_LIMIT: usize = 256;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,

    /// Enable permissive CORS headers for development
    pub enable_cors: bool,

    /// JWT secret for token validation
    pub jwt_secret: Option<String>,

    /// API key for authentication
    pub api_key: Option<String>,

    /// Maximum concurrent WebSocket connections
    pub connection_limit: usize,

    /// Knobs consumed by the session runtime
    pub project: ProjectConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8000)),
            enable_cors: false,
            jwt_secret: None,
            api_key: None,
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            project: ProjectConfig::default(),
        }
    }
}

/// On-disk layout of the configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    bind: Option<SocketAddr>,
    cors: Option<bool>,
    jwt_secret: Option<String>,
    api_key: Option<String>,
    connection_limit: Option<usize>,
    #[serde(default)]
    project: ProjectConfig,
}

impl ServerConfig {
    /// Parse a TOML configuration document on top of the defaults.
    pub fn from_toml_str(raw: &str) -> ServerResult<Self> {
        let file: ConfigFile =
            toml::from_str(raw).map_err(|err| ServerError::Config(err.to_string()))?;
        let defaults = Self::default();
        Ok(Self {
            bind_addr: file.bind.unwrap_or(defaults.bind_addr),
            enable_cors: file.cors.unwrap_or(defaults.enable_cors),
            jwt_secret: file.jwt_secret,
            api_key: file.api_key,
            connection_limit: file.connection_limit.unwrap_or(defaults.connection_limit),
            project: file.project,
        })
    }

    pub fn load(path: &Path) -> ServerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ServerError::Config(format!("Failed to read {}: {err}", path.display()))
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Check if authentication is configured
    pub fn requires_auth(&self) -> bool {
        self.api_key.is_some() || self.jwt_secret.is_some()
    }

    /// Project configuration as seen by the dispatcher. Configured
    /// credentials imply that login is required.
    pub fn effective_project(&self) -> ProjectConfig {
        ProjectConfig {
            require_login: self.project.require_login || self.requires_auth(),
            ..self.project.clone()
        }
    }
}
