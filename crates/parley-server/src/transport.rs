// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! WebSocket endpoint bridging sockets to the dispatcher
//!
//! The connect reaction runs before the upgrade, so a refused connection is
//! answered with a plain HTTP error and never becomes a socket. Each inbound
//! event is dispatched on its own task; a stop request or an ask answer can
//! therefore arrive while a message handler is still running.

use crate::error::ServerError;
use crate::protocol::{ClientFrame, Frame, RELOAD_EVENT};
use crate::state::AppState;
use async_trait::async_trait;
use axum::{
    extract::{
        Query, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_core::{ClientLink, ConnectRequest, InboundEvent, SessionError, SessionResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const USER_ENV_HEADER: &str = "user-env";

const OUTBOUND_BUFFER: usize = 256;

/// Query params accepted by the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Bearer token, for clients that cannot set headers
    pub token: Option<String>,
    pub session_id: Option<String>,
    /// JSON object with the user's environment variables
    pub user_env: Option<String>,
}

fn header_value(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn connect_request(
    connection_id: String,
    headers: &HeaderMap,
    query: ConnectQuery,
) -> ConnectRequest {
    ConnectRequest {
        connection_id,
        authorization: header_value(headers, header::AUTHORIZATION)
            .or_else(|| query.token.map(|token| format!("Bearer {token}"))),
        session_id: header_value(headers, SESSION_ID_HEADER).or(query.session_id),
        user_env: header_value(headers, USER_ENV_HEADER).or(query.user_env),
    }
}

/// Outbound half of one socket, handed to the session as its [`ClientLink`]
pub struct WsLink {
    connection_id: String,
    outbound: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl WsLink {
    pub fn new(connection_id: String, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            connection_id,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Hand the client's answer to the waiting ask.
    pub fn resolve(&self, id: u64, response: Value) {
        match self.pending.lock().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => {
                debug!(connection_id = %self.connection_id, id, "Dropping answer to unknown ask")
            }
        }
    }

    /// Fail every in-flight ask; later asks return immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
    }

    pub fn pending_asks(&self) -> usize {
        self.pending.lock().len()
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Transport(format!("connection {} is closed", self.connection_id))
    }
}

#[async_trait]
impl ClientLink for WsLink {
    async fn emit(&self, event: &str, payload: Value) -> SessionResult<()> {
        self.outbound
            .send(Frame::event(event, payload))
            .await
            .map_err(|_| self.closed_error())
    }

    async fn call(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> SessionResult<Option<Value>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (waiter, answer) = oneshot::channel();
        self.pending.lock().insert(id, waiter);
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().remove(&id);
            return Ok(None);
        }

        if self.outbound.send(Frame::request(event, id, payload)).await.is_err() {
            self.pending.lock().remove(&id);
            return Ok(None);
        }

        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                self.pending.lock().remove(&id);
                debug!(connection_id = %self.connection_id, id, "Ask timed out");
                Ok(None)
            }
        }
    }
}

/// `GET /ws`
pub async fn connect_socket(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let permit = match state.permits.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, refusing socket");
            return ServerError::RateLimited.into_response();
        }
    };

    let request = connect_request(uuid::Uuid::new_v4().to_string(), &headers, query);
    let connection_id = request.connection_id.clone();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let link = Arc::new(WsLink::new(connection_id.clone(), outbound_tx));

    match state.dispatcher.connect(request, link.clone()).await {
        Ok(outcome) => debug!(
            %connection_id,
            session_id = %outcome.session().id(),
            restored = outcome.is_restored(),
            "Connection accepted"
        ),
        Err(err) => {
            warn!(%connection_id, error = %err, "Connection refused");
            return ServerError::from(err).into_response();
        }
    }

    let dispatcher = state.dispatcher.clone();
    let failed_id = connection_id.clone();
    ws.on_failed_upgrade(move |err| {
        warn!(connection_id = %failed_id, error = %err, "WebSocket upgrade failed");
        tokio::spawn(async move {
            dispatcher.dispatch(&failed_id, InboundEvent::Disconnect).await;
        });
    })
    .on_upgrade(move |socket| run_socket(socket, state, connection_id, link, outbound_rx, permit))
}

async fn run_socket(
    socket: WebSocket,
    state: AppState,
    connection_id: String,
    link: Arc<WsLink>,
    mut outbound: mpsc::Receiver<Frame>,
    _permit: OwnedSemaphorePermit,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut reload = state.reload.subscribe();
    let mut reload_open = true;
    info!(%connection_id, "Socket connected");

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if sender.send(WsMessage::Text(frame.to_text())).await.is_err() {
                    break;
                }
            }
            notice = reload.recv(), if reload_open => {
                match notice {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let frame = Frame::event(RELOAD_EVENT, Value::Null);
                        if sender.send(WsMessage::Text(frame.to_text())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => reload_open = false,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !handle_text(&state, &connection_id, &link, &text) {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!(%connection_id, "Socket closed");
    link.close();
    state.dispatcher.dispatch(&connection_id, InboundEvent::Disconnect).await;
}

/// Returns false when the client asked to close the connection.
fn handle_text(state: &AppState, connection_id: &str, link: &WsLink, text: &str) -> bool {
    match ClientFrame::parse(text) {
        Ok(ClientFrame::AskResponse { id, response }) => link.resolve(id, response),
        Ok(ClientFrame::Event(InboundEvent::Disconnect)) => return false,
        Ok(ClientFrame::Event(event)) => {
            let dispatcher = state.dispatcher.clone();
            let connection_id = connection_id.to_string();
            tokio::spawn(async move {
                dispatcher.dispatch(&connection_id, event).await;
            });
        }
        Err(err) => warn!(%connection_id, error = %err, "Ignoring malformed frame"),
    }
    true
}
