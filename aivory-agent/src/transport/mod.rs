// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

pub mod wire;

use crate::config::AgentConfig;
use crate::log::agent_log;
use aivory_common::MutexExt;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use wire::{
    now_millis, BreakpointCommand, BreakpointHitPayload, ErrorPayload, ExceptionPayload,
    HeartbeatPayload, InboundFrame, OutboundFrame, RegisterPayload, FRAME_BREAKPOINT_HIT,
    FRAME_EXCEPTION, FRAME_HEARTBEAT, FRAME_REGISTER, INBOUND_ERROR, INBOUND_REGISTERED,
    INBOUND_REMOVE_BREAKPOINT, INBOUND_SET_BREAKPOINT,
};

pub(crate) const OFFLINE_QUEUE_CAPACITY: usize = 100;
pub(crate) const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const MAILBOX_CAPACITY: usize = 5000;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);
const DISCONNECT_WAIT: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type BreakpointCallback = Box<dyn Fn(BreakpointCommand, serde_json::Value) + Send + Sync>;

/// Delay before the i-th reconnection attempt (1-based).
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    RECONNECT_BASE.saturating_mul(factor).min(RECONNECT_CAP)
}

/// Bounded FIFO buffering serialized frames across outages. Overflow drops
/// the oldest frame.
struct OfflineQueue {
    frames: VecDeque<String>,
    capacity: usize,
}

impl OfflineQueue {
    fn new(capacity: usize) -> Self {
        OfflineQueue {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, json: String) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(json);
    }

    fn push_front(&mut self, json: String) {
        self.frames.push_front(json);
    }

    fn pop_front(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Default)]
struct ConnectionStatus {
    connected: AtomicBool,
    authenticated: AtomicBool,
}

impl ConnectionStatus {
    fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::SeqCst);
    }
    fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::SeqCst);
    }
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.is_authenticated()
    }
    fn reset(&self) {
        self.set_connected(false);
        self.set_authenticated(false);
    }
}

struct ShutdownLatch {
    finished: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownLatch {
    fn new() -> Self {
        ShutdownLatch {
            finished: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        *self.finished.lock_or_panic() = true;
        self.condvar.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let guard = self.finished.lock_or_panic();
        let _ = self
            .condvar
            .wait_timeout_while(guard, timeout, |finished| !*finished);
    }
}

struct ConnectionInner {
    config: Arc<AgentConfig>,
    sender: mpsc::Sender<String>,
    mailbox: Mutex<Option<mpsc::Receiver<String>>>,
    queue: Arc<Mutex<OfflineQueue>>,
    status: Arc<ConnectionStatus>,
    cancel: CancellationToken,
    latch: Arc<ShutdownLatch>,
    callback: Arc<RwLock<Option<BreakpointCallback>>>,
    started: AtomicBool,
}

/// Handle to the persistent backend channel. Cloneable and safe to use from
/// any thread; `send_*` never block on I/O.
#[derive(Clone)]
pub struct BackendConnection {
    inner: Arc<ConnectionInner>,
}

impl BackendConnection {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        let (sender, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        BackendConnection {
            inner: Arc::new(ConnectionInner {
                config,
                sender,
                mailbox: Mutex::new(Some(mailbox)),
                queue: Arc::new(Mutex::new(OfflineQueue::new(OFFLINE_QUEUE_CAPACITY))),
                status: Arc::new(ConnectionStatus::default()),
                cancel: CancellationToken::new(),
                latch: Arc::new(ShutdownLatch::new()),
                callback: Arc::new(RwLock::new(None)),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the connection worker on its own thread. Idempotent.
    pub fn connect(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mailbox) = self.inner.mailbox.lock_or_panic().take() else {
            return;
        };
        let worker = ConnectionWorker {
            config: Arc::clone(&self.inner.config),
            mailbox,
            sender: self.inner.sender.clone(),
            queue: Arc::clone(&self.inner.queue),
            status: Arc::clone(&self.inner.status),
            cancel: self.inner.cancel.clone(),
            callback: Arc::clone(&self.inner.callback),
            reconnect_attempts: 0,
        };
        let latch = Arc::clone(&self.inner.latch);
        let config = Arc::clone(&self.inner.config);
        let spawned = std::thread::Builder::new()
            .name("aivory-transport".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => {
                        runtime.block_on(worker.run());
                        runtime.shutdown_background();
                    }
                    Err(err) => {
                        agent_log!(config, ERROR, "failed to start transport runtime: {err}");
                    }
                }
                latch.notify();
            });
        if let Err(err) = spawned {
            agent_log!(self.inner.config, ERROR, "failed to spawn transport thread: {err}");
            self.inner.latch.notify();
        }
    }

    /// Closes the channel and stops the worker. Returns once the worker has
    /// exited or a bounded wait elapses. Idempotent.
    pub fn disconnect(&self) {
        self.inner.cancel.cancel();
        if self.inner.started.load(Ordering::SeqCst) {
            self.inner.latch.wait(DISCONNECT_WAIT);
        }
        self.inner.status.reset();
    }

    /// Connected and authenticated.
    pub fn is_connected(&self) -> bool {
        self.inner.status.is_connected()
    }

    pub fn set_breakpoint_callback(
        &self,
        callback: impl Fn(BreakpointCommand, serde_json::Value) + Send + Sync + 'static,
    ) {
        *self
            .inner
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    pub fn send_exception(&self, capture: crate::capture::ExceptionCapture) {
        let payload = ExceptionPayload {
            capture,
            agent_id: self.inner.config.agent_id.clone(),
            environment: self.inner.config.environment.clone(),
            runtime: self.inner.config.runtime_info(),
        };
        self.send(FRAME_EXCEPTION, payload);
    }

    pub fn send_breakpoint_hit(&self, payload: BreakpointHitPayload) {
        self.send(FRAME_BREAKPOINT_HIT, payload);
    }

    fn send<T: Serialize>(&self, kind: &'static str, payload: T) {
        let json = match OutboundFrame::new(kind, payload)
            .and_then(|frame| Ok(serde_json::to_string(&frame)?))
        {
            Ok(json) => json,
            Err(err) => {
                agent_log!(self.inner.config, DEBUG, "failed to encode {kind} frame: {err:#}");
                return;
            }
        };
        if self.inner.status.is_authenticated() {
            if let Err(err) = self.inner.sender.try_send(json) {
                self.inner.queue.lock_or_panic().push(err.into_inner());
            }
        } else {
            self.inner.queue.lock_or_panic().push(json);
        }
    }
}

enum Flow {
    Continue,
    Fatal,
}

struct ConnectionWorker {
    config: Arc<AgentConfig>,
    mailbox: mpsc::Receiver<String>,
    sender: mpsc::Sender<String>,
    queue: Arc<Mutex<OfflineQueue>>,
    status: Arc<ConnectionStatus>,
    cancel: CancellationToken,
    callback: Arc<RwLock<Option<BreakpointCallback>>>,
    reconnect_attempts: u32,
}

impl ConnectionWorker {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.connect_and_run().await {
                Ok(()) => break,
                Err(err) => {
                    agent_log!(self.config, DEBUG, "connection error: {err:#}");
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.reconnect_attempts += 1;
            if self.reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
                agent_log!(self.config, ERROR, "max reconnect attempts reached");
                break;
            }
            let delay = reconnect_delay(self.reconnect_attempts);
            agent_log!(
                self.config,
                DEBUG,
                "reconnecting in {delay:?} (attempt {})",
                self.reconnect_attempts
            );
            if self.wait_reconnect(delay).await {
                break;
            }
        }
        self.status.reset();
    }

    /// Backoff wait that keeps absorbing outbound frames into the offline
    /// queue. Returns true when shutdown was requested.
    async fn wait_reconnect(&mut self, delay: Duration) -> bool {
        let cancel = self.cancel.clone();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return true,
                _ = &mut sleep => return false,
                frame = self.mailbox.recv() => match frame {
                    Some(json) => self.queue.lock_or_panic().push(json),
                    None => return true,
                },
            }
        }
    }

    async fn connect_and_run(&mut self) -> anyhow::Result<()> {
        agent_log!(self.config, DEBUG, "connecting to {}", self.config.backend_url);
        let mut request = self.config.backend_url.as_str().into_client_request()?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))?,
        );
        let (socket, _response) = connect_async(request).await?;
        self.status.set_connected(true);
        self.reconnect_attempts = 0;
        agent_log!(self.config, DEBUG, "WebSocket connected");

        let (mut sink, mut stream) = socket.split();

        let register = OutboundFrame::new(FRAME_REGISTER, RegisterPayload::new(&self.config))?;
        sink.send(Message::Text(serde_json::to_string(&register)?))
            .await?;

        let heartbeat_cancel = self.cancel.child_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.config),
            Arc::clone(&self.status),
            self.sender.clone(),
            Arc::clone(&self.queue),
            heartbeat_cancel.clone(),
        ));

        let result = self.pump(&mut sink, &mut stream).await;

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;
        self.status.reset();
        result
    }

    async fn pump(&mut self, sink: &mut WsSink, stream: &mut WsSource) -> anyhow::Result<()> {
        let cancel = self.cancel.clone();
        loop {
            // Frames that raced the authenticated flag land in the queue;
            // pick them up before waiting on new events.
            if self.status.is_authenticated() && !self.queue.lock_or_panic().is_empty() {
                self.flush_queue(sink).await?;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = self.mailbox.recv() => match frame {
                    Some(json) => {
                        if self.status.is_authenticated() {
                            if let Err(err) = sink.send(Message::Text(json.clone())).await {
                                self.queue.lock_or_panic().push(json);
                                return Err(err.into());
                            }
                        } else {
                            self.queue.lock_or_panic().push(json);
                        }
                    }
                    None => {
                        self.cancel.cancel();
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    }
                },
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Flow::Fatal = self.handle_inbound(&text, sink).await? {
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => anyhow::bail!("connection closed by backend"),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => anyhow::bail!("connection lost"),
                },
            }
        }
    }

    async fn handle_inbound(&mut self, text: &str, sink: &mut WsSink) -> anyhow::Result<Flow> {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                agent_log!(self.config, DEBUG, "error parsing message: {err}");
                return Ok(Flow::Continue);
            }
        };
        agent_log!(self.config, DEBUG, "received: {}", frame.r#type);

        match frame.r#type.as_str() {
            INBOUND_REGISTERED => {
                self.status.set_authenticated(true);
                agent_log!(self.config, DEBUG, "agent registered");
                self.flush_queue(sink).await?;
            }
            INBOUND_ERROR => {
                let error: ErrorPayload =
                    serde_json::from_value(frame.payload).unwrap_or_default();
                agent_log!(
                    self.config,
                    ERROR,
                    "backend error: {} - {}",
                    error.code,
                    error.message
                );
                if matches!(error.code.as_str(), "auth_error" | "invalid_api_key") {
                    agent_log!(self.config, ERROR, "authentication failed, disabling reconnect");
                    self.reconnect_attempts = MAX_RECONNECT_ATTEMPTS;
                    self.cancel.cancel();
                    return Ok(Flow::Fatal);
                }
            }
            INBOUND_SET_BREAKPOINT => self.dispatch(BreakpointCommand::Set, frame.payload),
            INBOUND_REMOVE_BREAKPOINT => self.dispatch(BreakpointCommand::Remove, frame.payload),
            other => {
                agent_log!(self.config, DEBUG, "unhandled message type: {other}");
            }
        }
        Ok(Flow::Continue)
    }

    fn dispatch(&self, command: BreakpointCommand, payload: serde_json::Value) {
        let callback = self.callback.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = callback.as_ref() {
            callback(command, payload);
        }
    }

    async fn flush_queue(&mut self, sink: &mut WsSink) -> anyhow::Result<()> {
        loop {
            let next = self.queue.lock_or_panic().pop_front();
            let Some(json) = next else { break };
            if let Err(err) = sink.send(Message::Text(json.clone())).await {
                self.queue.lock_or_panic().push_front(json);
                return Err(err.into());
            }
        }
        Ok(())
    }
}

async fn heartbeat_loop(
    config: Arc<AgentConfig>,
    status: Arc<ConnectionStatus>,
    sender: mpsc::Sender<String>,
    queue: Arc<Mutex<OfflineQueue>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
        }
        if !status.is_authenticated() {
            continue;
        }
        let payload = HeartbeatPayload {
            agent_id: config.agent_id.clone(),
            timestamp: now_millis(),
        };
        let Ok(frame) = OutboundFrame::new(FRAME_HEARTBEAT, payload) else {
            continue;
        };
        let Ok(json) = serde_json::to_string(&frame) else {
            continue;
        };
        // Heartbeats follow the same queuing rules as every other frame.
        if let Err(err) = sender.try_send(json) {
            queue.lock_or_panic().push(err.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_schedule() {
        let cases = [
            (1, 1),
            (2, 2),
            (3, 4),
            (4, 8),
            (5, 16),
            (6, 32),
            (7, 60),
            (8, 60),
            (10, 60),
        ];
        for (attempt, secs) in cases {
            assert_eq!(
                reconnect_delay(attempt),
                Duration::from_secs(secs),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn test_offline_queue_drops_oldest() {
        let mut queue = OfflineQueue::new(OFFLINE_QUEUE_CAPACITY);
        for i in 1..=150 {
            queue.push(format!("frame-{i}"));
        }
        assert_eq!(queue.frames.len(), 100);
        assert_eq!(queue.pop_front().as_deref(), Some("frame-51"));
        let mut last = None;
        while let Some(frame) = queue.pop_front() {
            last = Some(frame);
        }
        assert_eq!(last.as_deref(), Some("frame-150"));
    }

    #[test]
    fn test_offline_queue_requeue_preserves_order() {
        let mut queue = OfflineQueue::new(3);
        queue.push("a".to_string());
        queue.push("b".to_string());
        let first = queue.pop_front().unwrap();
        queue.push_front(first);
        assert_eq!(queue.pop_front().as_deref(), Some("a"));
        assert_eq!(queue.pop_front().as_deref(), Some("b"));
    }

    #[test]
    fn test_send_enqueues_while_unauthenticated() {
        let config = Arc::new(
            crate::AgentConfig::from_settings(&crate::Settings {
                api_key: Some("k".to_string()),
                ..Default::default()
            })
            .unwrap(),
        );
        let connection = BackendConnection::new(config);
        for i in 0..3 {
            connection.send(FRAME_HEARTBEAT, HeartbeatPayload {
                agent_id: format!("a{i}"),
                timestamp: i,
            });
        }
        let queue = connection.inner.queue.lock_or_panic();
        assert_eq!(queue.frames.len(), 3);
        assert!(queue.frames[0].contains("\"a0\""));
        assert!(!connection.is_connected());
    }
}
