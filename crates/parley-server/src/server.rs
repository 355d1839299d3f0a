// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Main server implementation

use crate::auth::AuthConfig;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handlers;
use crate::reload::ReloadBroadcaster;
use crate::state::AppState;
use crate::transport;
use axum::{Router, routing::get};
use parley_core::{Dispatcher, DispatcherBuilder, Hooks};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Chat server: socket endpoint plus a few plain HTTP routes
pub struct Server {
    config: ServerConfig,
    app: Router,
    dispatcher: Dispatcher,
    reload: ReloadBroadcaster,
}

impl Server {
    /// Dispatcher builder preloaded with the project settings and the
    /// configured credentials.
    pub fn dispatcher_builder(config: &ServerConfig) -> DispatcherBuilder {
        Dispatcher::builder(config.effective_project())
            .authenticator(Arc::new(Self::auth_config(config)))
    }

    /// Create a server driving `hooks`
    pub fn new(config: ServerConfig, hooks: Hooks) -> Self {
        let dispatcher = Self::dispatcher_builder(&config).hooks(hooks).build();
        Self::with_dispatcher(config, dispatcher)
    }

    /// Construct a server around an already-built dispatcher
    pub fn with_dispatcher(config: ServerConfig, dispatcher: Dispatcher) -> Self {
        let reload = ReloadBroadcaster::new();
        let state = AppState {
            dispatcher: dispatcher.clone(),
            auth: Self::auth_config(&config),
            reload: reload.clone(),
            permits: Arc::new(Semaphore::new(config.connection_limit)),
        };
        let app = Self::build_app(state, &config);
        Self {
            config,
            app,
            dispatcher,
            reload,
        }
    }

    fn auth_config(config: &ServerConfig) -> AuthConfig {
        AuthConfig {
            api_key: config.api_key.clone(),
            jwt_secret: config.jwt_secret.clone(),
        }
    }

    /// Build the Axum application with routes and middleware
    fn build_app(state: AppState, config: &ServerConfig) -> Router {
        let app = Router::new()
            .route("/ws", get(transport::connect_socket))
            .route("/healthz", get(handlers::health_check))
            .route("/project/settings", get(handlers::project_settings))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if config.enable_cors {
            app.layer(CorsLayer::permissive())
        } else {
            app
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Handle for pushing `reload` to every connected client
    pub fn reload_handle(&self) -> ReloadBroadcaster {
        self.reload.clone()
    }

    /// Get the bind address
    pub fn addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server on the configured address
    pub async fn run(self) -> ServerResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> ServerResult<()> {
        info!("Starting server on {}", listener.local_addr()?);
        axum::serve(listener, self.app)
            .await
            .map_err(|err| ServerError::Internal(format!("Server error: {err}")))
    }
}
