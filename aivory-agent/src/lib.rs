// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

//! In-process remote debugging agent for the AIVory backend.
//!
//! The agent captures failures together with the program state around them
//! (frame chains, bounded snapshots of locals, request/user context) and
//! supports live breakpoints installed over a persistent bidirectional
//! channel: when instrumented execution crosses a registered line, the agent
//! snapshots the frame and reports the hit without stopping the process.
//!
//! The [`Agent`] type is the primary API; the free functions below are a thin
//! convenience wrapper around one process-global agent:
//!
//! ```no_run
//! use aivory_agent::Settings;
//!
//! aivory_agent::init(Settings {
//!     api_key: Some("your-api-key".to_string()),
//!     environment: Some("production".to_string()),
//!     ..Settings::from_env()
//! })?;
//!
//! // Manually capture an error
//! if let Err(err) = std::fs::read("config.json") {
//!     aivory_agent::capture_exception(&err, None)?;
//! }
//! # Ok::<(), aivory_agent::AgentError>(())
//! ```
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod agent;
pub mod capture;
mod config;
mod exception;
mod log;
pub mod tracer;
pub mod transport;

pub use agent::{Agent, AgentError};
pub use capture::{
    fingerprint, Bytes, CaptureEngine, CaptureLimits, CapturedValue, ExceptionCapture,
    ExceptionInfo, Inspect, Shape, StackFrame,
};
pub use config::{AgentConfig, ConfigError, RuntimeInfo, Settings};
pub use exception::ExceptionHandler;
pub use tracer::{record_line, BreakpointCondition, FrameContext, FrameGuard, TraceManager};
pub use transport::BackendConnection;

use crate::log::agent_log;
use aivory_common::MutexExt;
use serde_json::{Map, Value};
use std::sync::Mutex;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

static AGENT: Mutex<Option<Agent>> = Mutex::new(None);

/// Initializes the process-global agent and starts it.
///
/// Returns [`AgentError::AlreadyInitialized`] on a second call so misuse is
/// observable instead of silently ignored.
pub fn init(settings: Settings) -> Result<(), AgentError> {
    let mut slot = AGENT.lock_or_panic();
    if slot.is_some() {
        return Err(AgentError::AlreadyInitialized);
    }
    let config = AgentConfig::from_settings(&settings)?;
    let agent = Agent::new(config)?;
    agent.start();
    agent_log!(
        agent.config(),
        DEBUG,
        "agent v{AGENT_VERSION} initialized ({})",
        agent.config().environment
    );
    *slot = Some(agent);
    Ok(())
}

/// Stops and discards the process-global agent. Idempotent.
pub fn shutdown() {
    if let Some(agent) = AGENT.lock_or_panic().take() {
        agent.stop();
    }
}

/// Manually capture an error through the process-global agent.
pub fn capture_exception<E: std::error::Error + ?Sized>(
    error: &E,
    context: Option<Map<String, Value>>,
) -> Result<(), AgentError> {
    match AGENT.lock_or_panic().as_ref() {
        Some(agent) => {
            agent.capture_exception(error, context);
            Ok(())
        }
        None => Err(AgentError::NotInitialized),
    }
}

/// Sets the custom context attached to every capture.
pub fn set_context(context: Map<String, Value>) -> Result<(), AgentError> {
    match AGENT.lock_or_panic().as_ref() {
        Some(agent) => {
            agent.config().set_custom_context(context);
            Ok(())
        }
        None => Err(AgentError::NotInitialized),
    }
}

/// Sets the current user identity attached to every capture.
pub fn set_user(
    user_id: Option<&str>,
    email: Option<&str>,
    username: Option<&str>,
) -> Result<(), AgentError> {
    match AGENT.lock_or_panic().as_ref() {
        Some(agent) => {
            agent.config().set_user(user_id, email, username);
            Ok(())
        }
        None => Err(AgentError::NotInitialized),
    }
}

pub fn is_initialized() -> bool {
    AGENT.lock_or_panic().is_some()
}
