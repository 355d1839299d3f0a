// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use parley_core::{Dispatcher, Hooks};
use parley_server::{ReloadBroadcaster, Server, ServerConfig};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub dispatcher: Dispatcher,
    pub reload: ReloadBroadcaster,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl TestServer {
    pub async fn spawn(config: ServerConfig, hooks: Hooks) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = Server::new(config, hooks);
        let dispatcher = server.dispatcher().clone();
        let reload = server.reload_handle();
        let handle = tokio::spawn(async move {
            server.serve(listener).await.expect("server run");
        });
        Self {
            addr,
            dispatcher,
            reload,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/ws{}", self.addr, query)
    }

    pub async fn connect(&self, query: &str) -> Result<Socket, WsError> {
        tokio_tungstenite::connect_async(self.ws_url(query)).await.map(|(socket, _)| socket)
    }

    pub async fn connect_with_headers(
        &self,
        headers: &[(&'static str, &str)],
    ) -> Result<Socket, WsError> {
        let mut request = self.ws_url("").into_client_request()?;
        for (name, value) in headers {
            request
                .headers_mut()
                .insert(*name, value.parse().expect("header value"));
        }
        tokio_tungstenite::connect_async(request).await.map(|(socket, _)| socket)
    }
}

/// HTTP status of a refused upgrade.
pub fn refusal_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP refusal, got {other:?}"),
    }
}

pub async fn send(socket: &mut Socket, event: &str, data: Value) {
    let frame = json!({ "event": event, "data": data });
    socket
        .send(WsMessage::Text(frame.to_string()))
        .await
        .expect("send frame");
}

/// Next JSON frame from the server, failing after five seconds.
pub async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame before timeout")
            .expect("socket open")
            .expect("valid frame");
        if let WsMessage::Text(text) = message {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

/// Event names of the next `count` frames.
pub async fn next_events(socket: &mut Socket, count: usize) -> Vec<Value> {
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        frames.push(next_frame(socket).await);
    }
    frames
}

pub fn names(frames: &[Value]) -> Vec<&str> {
    frames.iter().filter_map(|frame| frame["event"].as_str()).collect()
}

/// Poll `check` until it holds, failing after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
