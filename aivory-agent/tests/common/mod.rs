// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// An in-process stand-in for the AIVory backend: one WebSocket listener
/// handing out accepted sessions.
pub struct TestBackend {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl TestBackend {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        TestBackend { listener, addr }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn accept(&self) -> BackendSession {
        let (stream, _) = timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for agent connection")
            .unwrap();
        let socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        BackendSession { socket }
    }

    /// Accepts a connection and returns the `Authorization` header the agent
    /// sent in the handshake.
    pub async fn accept_with_authorization(&self) -> (BackendSession, Option<String>) {
        use std::sync::{Arc, Mutex};
        let (stream, _) = timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for agent connection")
            .unwrap();
        let authorization = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&authorization);
        let socket = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                  resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
                *seen.lock().unwrap() = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(resp)
            },
        )
        .await
        .unwrap();
        let header = authorization.lock().unwrap().clone();
        (BackendSession { socket }, header)
    }

    /// Asserts that no connection arrives within `window`.
    pub async fn expect_no_connection(&self, window: Duration) {
        assert!(
            timeout(window, self.listener.accept()).await.is_err(),
            "agent reconnected when it should have given up"
        );
    }
}

pub struct BackendSession {
    socket: WebSocketStream<TcpStream>,
}

impl BackendSession {
    pub async fn recv_frame(&mut self) -> Value {
        loop {
            let message = timeout(RECV_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection ended")
                .unwrap();
            match message {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(data) => {
                    let _ = self.socket.send(Message::Pong(data)).await;
                }
                Message::Close(_) => panic!("connection closed while waiting for a frame"),
                _ => {}
            }
        }
    }

    /// Receives frames until one of type `frame_type` arrives.
    pub async fn recv_frame_of_type(&mut self, frame_type: &str) -> Value {
        loop {
            let frame = self.recv_frame().await;
            if frame["type"] == frame_type {
                return frame;
            }
        }
    }

    pub async fn expect_register(&mut self) -> Value {
        let frame = self.recv_frame().await;
        assert_eq!(frame["type"], "register", "first frame must be register");
        frame
    }

    pub async fn send_json(&mut self, value: Value) {
        self.socket
            .send(Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_registered(&mut self) {
        self.send_json(serde_json::json!({"type": "registered", "payload": {}}))
            .await;
    }
}

/// Polls until the handle reports connected-and-authenticated; sends made
/// after this point take the direct path rather than the offline queue.
pub async fn wait_until_connected(connection: &aivory_agent::BackendConnection) {
    for _ in 0..100 {
        if connection.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("connection never became authenticated");
}

pub fn test_settings(url: &str) -> aivory_agent::Settings {
    aivory_agent::Settings {
        api_key: Some("test-key".to_string()),
        backend_url: Some(url.to_string()),
        ..Default::default()
    }
}

pub fn is_hex_fingerprint(fingerprint: &str) -> bool {
    fingerprint.len() == 16
        && fingerprint
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
