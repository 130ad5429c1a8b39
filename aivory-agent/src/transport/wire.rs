// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

use crate::capture::{CapturedValue, ExceptionCapture, StackFrame};
use crate::config::{AgentConfig, RuntimeInfo};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const FRAME_REGISTER: &str = "register";
pub const FRAME_EXCEPTION: &str = "exception";
pub const FRAME_BREAKPOINT_HIT: &str = "breakpoint_hit";
pub const FRAME_HEARTBEAT: &str = "heartbeat";

pub const INBOUND_REGISTERED: &str = "registered";
pub const INBOUND_ERROR: &str = "error";
pub const INBOUND_SET_BREAKPOINT: &str = "set_breakpoint";
pub const INBOUND_REMOVE_BREAKPOINT: &str = "remove_breakpoint";

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Every frame on the wire: `{ type, payload, timestamp }`.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub r#type: &'static str,
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

impl OutboundFrame {
    pub fn new(r#type: &'static str, payload: impl Serialize) -> anyhow::Result<Self> {
        Ok(OutboundFrame {
            r#type,
            payload: serde_json::to_value(payload)?,
            timestamp: now_millis(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterPayload {
    pub api_key: String,
    pub agent_id: String,
    pub hostname: String,
    pub environment: String,
    pub agent_version: &'static str,
    #[serde(flatten)]
    pub runtime: RuntimeInfo,
}

impl RegisterPayload {
    pub fn new(config: &AgentConfig) -> Self {
        RegisterPayload {
            api_key: config.api_key.clone(),
            agent_id: config.agent_id.clone(),
            hostname: config.hostname.clone(),
            environment: config.environment.clone(),
            agent_version: crate::AGENT_VERSION,
            runtime: config.runtime_info(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExceptionPayload {
    #[serde(flatten)]
    pub capture: ExceptionCapture,
    pub agent_id: String,
    pub environment: String,
    #[serde(flatten)]
    pub runtime: RuntimeInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakpointHitPayload {
    pub breakpoint_id: String,
    pub agent_id: String,
    pub captured_at: String,
    pub file_path: String,
    pub line_number: u32,
    pub stack_trace: Vec<StackFrame>,
    pub local_variables: IndexMap<String, CapturedValue>,
    pub hit_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub agent_id: String,
    pub timestamp: u64,
}

/// Inbound frames are decoded loosely so unknown types and sparse payloads
/// stay forward-compatible.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub r#type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetBreakpointPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub line_number: u32,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub max_hits: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoveBreakpointPayload {
    #[serde(default)]
    pub id: String,
}

/// Control-plane directives forwarded to the breakpoint engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointCommand {
    Set,
    Remove,
}
