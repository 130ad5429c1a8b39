// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

use crate::capture::CaptureLimits;
use aivory_common::config::parse_env;
use aivory_common::MutexExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_BACKEND_URL: &str = "wss://api.aivory.net/monitor/agent";
pub const DEFAULT_ENVIRONMENT: &str = "production";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("api_key is required; set AIVORY_API_KEY or pass api_key")]
    MissingApiKey,
    #[error("invalid value for {var}: {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Settings gathers raw configuration options from the environment. Explicit
/// values win over `AIVORY_*` variables, so callers override fields before
/// handing the struct to [`AgentConfig::from_settings`]:
///
/// ```
/// use aivory_agent::{AgentConfig, Settings};
///
/// let settings = Settings {
///     api_key: Some("test-key".to_string()),
///     ..Settings::from_env()
/// };
/// let config = AgentConfig::from_settings(&settings).unwrap();
/// assert_eq!(config.environment, "production");
/// ```
#[derive(Debug, Default)]
pub struct Settings {
    pub api_key: Option<String>,
    pub backend_url: Option<String>,
    pub environment: Option<String>,
    pub sampling_rate: Option<String>,
    pub max_capture_depth: Option<String>,
    pub max_string_length: Option<String>,
    pub max_collection_size: Option<String>,
    pub enable_breakpoints: Option<bool>,
    pub debug: Option<bool>,
}

impl Settings {
    const AIVORY_API_KEY: &'static str = "AIVORY_API_KEY";
    const AIVORY_BACKEND_URL: &'static str = "AIVORY_BACKEND_URL";
    const AIVORY_ENVIRONMENT: &'static str = "AIVORY_ENVIRONMENT";
    const AIVORY_SAMPLING_RATE: &'static str = "AIVORY_SAMPLING_RATE";
    const AIVORY_MAX_DEPTH: &'static str = "AIVORY_MAX_DEPTH";
    const AIVORY_MAX_STRING_LENGTH: &'static str = "AIVORY_MAX_STRING_LENGTH";
    const AIVORY_MAX_COLLECTION_SIZE: &'static str = "AIVORY_MAX_COLLECTION_SIZE";
    const AIVORY_ENABLE_BREAKPOINTS: &'static str = "AIVORY_ENABLE_BREAKPOINTS";
    const AIVORY_DEBUG: &'static str = "AIVORY_DEBUG";

    pub fn from_env() -> Self {
        Self {
            api_key: parse_env::str_not_empty(Self::AIVORY_API_KEY),
            backend_url: parse_env::str_not_empty(Self::AIVORY_BACKEND_URL),
            environment: parse_env::str_not_empty(Self::AIVORY_ENVIRONMENT),
            sampling_rate: parse_env::str_not_empty(Self::AIVORY_SAMPLING_RATE),
            max_capture_depth: parse_env::str_not_empty(Self::AIVORY_MAX_DEPTH),
            max_string_length: parse_env::str_not_empty(Self::AIVORY_MAX_STRING_LENGTH),
            max_collection_size: parse_env::str_not_empty(Self::AIVORY_MAX_COLLECTION_SIZE),
            enable_breakpoints: parse_env::str_not_empty(Self::AIVORY_ENABLE_BREAKPOINTS)
                .map(|v| v.to_lowercase() != "false"),
            debug: parse_env::bool(Self::AIVORY_DEBUG),
        }
    }
}

/// Runtime identification block attached to `register` and `exception`
/// frames.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeInfo {
    pub runtime: &'static str,
    pub runtime_version: &'static str,
    pub platform: &'static str,
    pub arch: &'static str,
    pub implementation: &'static str,
}

/// Process-wide agent configuration: immutable tunables plus the mutable
/// custom context and user identity maps.
#[derive(Debug)]
pub struct AgentConfig {
    pub api_key: String,
    pub backend_url: String,
    pub environment: String,
    /// Probability in [0, 1] that a hook-invoked capture is reported.
    pub sampling_rate: f64,
    pub limits: CaptureLimits,
    pub enable_breakpoints: bool,
    pub debug: bool,
    pub hostname: String,
    /// Generated once at construction, stable for the process lifetime.
    pub agent_id: String,
    custom_context: Mutex<Map<String, Value>>,
    user: Mutex<Map<String, Value>>,
}

fn parse_field<T: FromStr>(
    var: &'static str,
    raw: &Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidNumber {
            var,
            value: value.clone(),
        }),
    }
}

fn generate_agent_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    format!("agent-{:x}-{:08x}", secs, rand::random::<u32>())
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_settings(&Settings::from_env())
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or(ConfigError::MissingApiKey)?;
        let defaults = CaptureLimits::default();

        let sampling_rate: f64 = parse_field(
            Settings::AIVORY_SAMPLING_RATE,
            &settings.sampling_rate,
            1.0,
        )?;

        Ok(Self {
            api_key,
            backend_url: settings
                .backend_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            environment: settings
                .environment
                .clone()
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            sampling_rate: sampling_rate.clamp(0.0, 1.0),
            limits: CaptureLimits {
                max_capture_depth: parse_field(
                    Settings::AIVORY_MAX_DEPTH,
                    &settings.max_capture_depth,
                    defaults.max_capture_depth,
                )?,
                max_string_length: parse_field(
                    Settings::AIVORY_MAX_STRING_LENGTH,
                    &settings.max_string_length,
                    defaults.max_string_length,
                )?,
                max_collection_size: parse_field(
                    Settings::AIVORY_MAX_COLLECTION_SIZE,
                    &settings.max_collection_size,
                    defaults.max_collection_size,
                )?,
            },
            enable_breakpoints: settings.enable_breakpoints.unwrap_or(true),
            debug: settings.debug.unwrap_or(false),
            hostname: aivory_common::hostname(),
            agent_id: generate_agent_id(),
            custom_context: Mutex::new(Map::new()),
            user: Mutex::new(Map::new()),
        })
    }

    /// Determine whether the current event should be sampled.
    pub fn should_sample(&self) -> bool {
        if self.sampling_rate >= 1.0 {
            return true;
        }
        if self.sampling_rate <= 0.0 {
            return false;
        }
        rand::random::<f64>() < self.sampling_rate
    }

    pub fn set_custom_context(&self, context: Map<String, Value>) {
        *self.custom_context.lock_or_panic() = context;
    }

    pub fn custom_context(&self) -> Map<String, Value> {
        self.custom_context.lock_or_panic().clone()
    }

    /// Replaces the current user identity; `None` fields are omitted from the
    /// stored map.
    pub fn set_user(&self, user_id: Option<&str>, email: Option<&str>, username: Option<&str>) {
        let mut user = Map::new();
        if let Some(id) = user_id {
            user.insert("id".to_string(), Value::String(id.to_string()));
        }
        if let Some(email) = email {
            user.insert("email".to_string(), Value::String(email.to_string()));
        }
        if let Some(username) = username {
            user.insert("username".to_string(), Value::String(username.to_string()));
        }
        *self.user.lock_or_panic() = user;
    }

    pub fn user(&self) -> Map<String, Value> {
        self.user.lock_or_panic().clone()
    }

    pub fn runtime_info(&self) -> RuntimeInfo {
        RuntimeInfo {
            runtime: "rust",
            runtime_version: env!("CARGO_PKG_RUST_VERSION"),
            platform: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            implementation: "rustc",
        }
    }
}
