// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Parley chat server binary
//!
//! Serves a small echo assistant; embedders build their own [`Hooks`].

use clap::Parser;
use parley_core::{
    Action, AskUser, ConversationClient, FileSpec, Hooks, InMemoryConversationClient, Message,
};
use parley_logging::CliLoggingArgs;
use parley_server::{ReloadBroadcaster, Server, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address for the server
    #[arg(short, long, env = "PARLEY_BIND")]
    bind: Option<SocketAddr>,

    /// Configuration file (TOML)
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable permissive CORS for development
    #[arg(long)]
    cors: bool,

    /// API key clients must present as `ApiKey <key>`
    #[arg(long, env = "PARLEY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Secret used to validate `Bearer` JWTs
    #[arg(long, env = "PARLEY_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Grace period in seconds before a disconnected session is dropped
    #[arg(long, env = "PARLEY_SESSION_TIMEOUT")]
    session_timeout: Option<u64>,

    /// Environment variable every client must provide (repeatable)
    #[arg(long = "user-env", value_name = "NAME")]
    user_env: Vec<String>,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        config.enable_cors |= self.cors;
        if self.api_key.is_some() {
            config.api_key = self.api_key;
        }
        if self.jwt_secret.is_some() {
            config.jwt_secret = self.jwt_secret;
        }
        if let Some(timeout) = self.session_timeout {
            config.project.session_timeout = timeout;
        }
        if !self.user_env.is_empty() {
            config.project.user_env = self.user_env;
        }
        Ok(config)
    }
}

fn echo_hooks() -> Hooks {
    Hooks::new()
        .on_chat_start(|| async {
            Message::new(
                "Connected. Send a message and it will be echoed back; \
                 send `ask` to be asked a question.",
            )
            .send()
            .await?;
            anyhow::Ok(())
        })
        .on_message(|content, id| async move {
            if content == "ask" {
                let answer = AskUser::new("What should I echo?").timeout(60).send().await?;
                let reply = match answer {
                    Some(answer) => answer.content,
                    None => "No answer received.".to_string(),
                };
                Message::new(reply).with_parent(id).send().await?;
            } else {
                Message::new(content).with_parent(id).send().await?;
            }
            anyhow::Ok(())
        })
        .on_stop(|| async {
            tracing::info!("Echo task stopped");
            anyhow::Ok(())
        })
        .on_file_upload(FileSpec::new(&["text/plain"]), |files| async move {
            Message::json(&files).send().await?;
            anyhow::Ok(())
        })
        .action("shout", |action: Action| async move {
            Message::new(action.value.to_uppercase()).send().await?;
            anyhow::Ok(())
        })
}

/// Push `reload` to every client when the process receives SIGHUP.
#[cfg(unix)]
fn reload_on_hangup(reload: ReloadBroadcaster) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "Reload on SIGHUP unavailable");
                return;
            }
        };
        while hangups.recv().await.is_some() {
            reload.broadcast_reload();
        }
    });
}

#[cfg(not(unix))]
fn reload_on_hangup(_reload: ReloadBroadcaster) {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();
    std::mem::take(&mut args.logging).init("parley-server")?;

    let config = args.into_config()?;
    tracing::info!(
        bind = %config.bind_addr,
        require_login = config.effective_project().require_login,
        "Starting parley server"
    );

    let conversations: Arc<dyn ConversationClient> = Arc::new(InMemoryConversationClient::new());
    let dispatcher = Server::dispatcher_builder(&config)
        .hooks(echo_hooks())
        .conversation_client(conversations)
        .build();

    let server = Server::with_dispatcher(config, dispatcher);
    reload_on_hangup(server.reload_handle());

    server.run().await?;
    Ok(())
}
