// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

use crate::config::{AgentConfig, ConfigError};
use crate::exception::ExceptionHandler;
use crate::log::agent_log;
use crate::tracer::{FrameContext, TraceManager};
use crate::transport::BackendConnection;
use aivory_common::MutexExt;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("agent already initialized")]
    AlreadyInitialized,
    #[error("agent not initialized")]
    NotInitialized,
}

struct AgentInner {
    config: Arc<AgentConfig>,
    connection: BackendConnection,
    handler: ExceptionHandler,
    tracer: Option<Arc<TraceManager>>,
    started: AtomicBool,
    signals_watched: AtomicBool,
    exit_cleanup_registered: AtomicBool,
}

impl AgentInner {
    fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tracer) = &self.tracer {
            tracer.disable();
        }
        self.handler.uninstall();
        self.connection.disconnect();
        agent_log!(self.config, DEBUG, "agent stopped");
    }
}

/// Coordinates the transport, the exception hook and the breakpoint engine.
///
/// ```no_run
/// use aivory_agent::{Agent, AgentConfig, Settings};
///
/// let config = AgentConfig::from_settings(&Settings {
///     api_key: Some("my-key".to_string()),
///     ..Settings::from_env()
/// })?;
/// let agent = Agent::new(config)?;
/// agent.start();
/// # Ok::<(), aivory_agent::AgentError>(())
/// ```
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey.into());
        }
        let config = Arc::new(config);
        let connection = BackendConnection::new(Arc::clone(&config));
        let handler = ExceptionHandler::new(Arc::clone(&config), connection.clone());
        let tracer = config
            .enable_breakpoints
            .then(|| TraceManager::new(Arc::clone(&config), connection.clone()));
        Ok(Agent {
            inner: Arc::new(AgentInner {
                config,
                connection,
                handler,
                tracer,
                started: AtomicBool::new(false),
                signals_watched: AtomicBool::new(false),
                exit_cleanup_registered: AtomicBool::new(false),
            }),
        })
    }

    /// Starts every component in dependency order and registers
    /// process-exit and termination-signal cleanup. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.connection.connect();
        self.inner.handler.install();
        if let Some(tracer) = &self.inner.tracer {
            tracer.enable();
        }
        register_exit_cleanup(&self.inner);
        watch_termination_signals(&self.inner);
        agent_log!(self.inner.config, DEBUG, "agent started");
    }

    /// Stops components in reverse start order. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn capture_exception<E: std::error::Error + ?Sized>(
        &self,
        error: &E,
        context: Option<Map<String, Value>>,
    ) {
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        self.inner.handler.capture(error, context);
    }

    /// Like [`Agent::capture_exception`], with the innermost frame (and its
    /// locals) supplied by the caller.
    pub fn capture_exception_with_frame<E: std::error::Error + ?Sized>(
        &self,
        error: &E,
        context: Option<Map<String, Value>>,
        frame: &FrameContext<'_>,
    ) {
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        self.inner.handler.capture_with_frame(error, context, frame);
    }

    /// Reports an error the application had to swallow.
    pub fn capture_suppressed<E: std::error::Error + ?Sized>(&self, error: &E, note: &str) {
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        self.inner.handler.capture_suppressed(error, note);
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn tracer(&self) -> Option<&Arc<TraceManager>> {
        self.inner.tracer.as_ref()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

/// Agents with pending process-exit cleanup. Weak handles, so a dropped
/// agent simply disappears from the list.
static ACTIVE_AGENTS: Mutex<Vec<Weak<AgentInner>>> = Mutex::new(Vec::new());
#[cfg(unix)]
static EXIT_HOOK: std::sync::Once = std::sync::Once::new();

/// Puts the agent on the process-exit cleanup list, so a `process::exit`
/// anywhere still disconnects the transport instead of dropping queued
/// captures. The libc hook itself is installed once per process.
fn register_exit_cleanup(inner: &Arc<AgentInner>) {
    if inner.exit_cleanup_registered.swap(true, Ordering::SeqCst) {
        return;
    }
    let mut agents = ACTIVE_AGENTS.lock_or_panic();
    agents.retain(|agent| agent.strong_count() > 0);
    agents.push(Arc::downgrade(inner));
    drop(agents);
    #[cfg(unix)]
    EXIT_HOOK.call_once(|| unsafe {
        libc::atexit(stop_agents_at_exit);
    });
}

#[cfg(unix)]
extern "C" fn stop_agents_at_exit() {
    // Never block or fail inside atexit; skip if something else holds the
    // list.
    if let Ok(agents) = ACTIVE_AGENTS.try_lock() {
        for agent in agents.iter() {
            if let Some(inner) = agent.upgrade() {
                inner.stop();
            }
        }
    }
}

/// Detached watcher that stops the agent on SIGINT/SIGTERM and then exits the
/// process, mirroring the usual interactive shutdown path. Holds only a weak
/// handle so a dropped agent does not keep the thread's exit behavior armed.
fn watch_termination_signals(inner: &Arc<AgentInner>) {
    if inner.signals_watched.swap(true, Ordering::SeqCst) {
        return;
    }
    let weak: Weak<AgentInner> = Arc::downgrade(inner);
    let spawned = std::thread::Builder::new()
        .name("aivory-signals".to_string())
        .spawn(move || {
            let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            else {
                return;
            };
            runtime.block_on(wait_for_termination());
            if let Some(inner) = weak.upgrade() {
                inner.stop();
                std::process::exit(0);
            }
        });
    if let Err(err) = spawned {
        agent_log!(inner.config, DEBUG, "failed to spawn signal watcher: {err}");
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let interrupt = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = interrupt => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = interrupt.await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
