// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

use crate::capture::stacktrace::{frames_from_backtrace, StackFrame};
use crate::capture::{CaptureEngine, CapturedValue};
use crate::config::AgentConfig;
use crate::tracer::frame::{stack_frame_from_context, traced_stack, FrameContext};
use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// How many leading non-native frames participate in the fingerprint.
const FINGERPRINT_FRAMES: usize = 5;
const FINGERPRINT_HEX_CHARS: usize = 16;

/// Complete report for one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionCapture {
    pub id: String,
    pub exception_type: String,
    pub message: String,
    pub fingerprint: String,
    pub stack_trace: Vec<StackFrame>,
    pub local_variables: IndexMap<String, CapturedValue>,
    pub context: Map<String, Value>,
    pub captured_at: String,
}

/// The identity of a failure being reported: its type name and message.
#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    pub exception_type: String,
    pub message: String,
}

impl ExceptionInfo {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        ExceptionInfo {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }

    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        ExceptionInfo::new(short_type_name::<E>(), error.to_string())
    }

    pub fn from_panic(info: &std::panic::PanicHookInfo<'_>) -> Self {
        let payload = info.payload();
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "panic".to_string()
        };
        ExceptionInfo::new("panic", message)
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

pub(crate) fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds [`ExceptionCapture`]s: frame chain, innermost-frame locals,
/// fingerprint, merged context.
pub struct ExceptionCaptureBuilder {
    config: Arc<AgentConfig>,
    engine: CaptureEngine,
}

impl ExceptionCaptureBuilder {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        let engine = CaptureEngine::new(config.limits);
        ExceptionCaptureBuilder { config, engine }
    }

    /// Capture `exception` together with the surrounding program state.
    ///
    /// The frame chain comes from the calling thread's registered frames when
    /// instrumentation is active; otherwise from `frame` (the innermost scope
    /// as seen by the caller) or, failing both, from a resolved backtrace.
    pub fn capture(
        &self,
        exception: &ExceptionInfo,
        context_overrides: Option<Map<String, Value>>,
        frame: Option<&FrameContext<'_>>,
    ) -> ExceptionCapture {
        let stack_trace = self.build_stack(frame);
        let local_variables = frame
            .map(|frame| self.engine.capture_locals(frame.locals))
            .unwrap_or_default();
        let fingerprint = fingerprint(&exception.exception_type, &stack_trace);

        ExceptionCapture {
            id: uuid::Uuid::new_v4().to_string(),
            exception_type: exception.exception_type.clone(),
            message: exception.message.clone(),
            fingerprint,
            stack_trace,
            local_variables,
            context: self.merge_context(context_overrides),
            captured_at: utc_timestamp(),
        }
    }

    fn build_stack(&self, frame: Option<&FrameContext<'_>>) -> Vec<StackFrame> {
        let traced = traced_stack();
        if !traced.is_empty() {
            return traced;
        }
        match frame {
            Some(frame) => vec![stack_frame_from_context(frame)],
            None => frames_from_backtrace(&backtrace::Backtrace::new()),
        }
    }

    fn merge_context(&self, overrides: Option<Map<String, Value>>) -> Map<String, Value> {
        let mut context = self.config.custom_context();
        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                context.insert(key, value);
            }
        }
        context.insert("user".to_string(), Value::Object(self.config.user()));
        context
    }
}

/// Deterministic failure fingerprint: SHA-256 over the exception type and the
/// first up-to-5 non-native `method:line` pairs, truncated to 16 hex chars.
pub fn fingerprint(exception_type: &str, stack_trace: &[StackFrame]) -> String {
    let mut parts = vec![exception_type.to_string()];
    parts.extend(
        stack_trace
            .iter()
            .filter(|frame| !frame.is_native)
            .take(FINGERPRINT_FRAMES)
            .map(|frame| format!("{}:{}", frame.method_name, frame.line_number.unwrap_or(0))),
    );
    let digest = Sha256::digest(parts.join(":").as_bytes());
    hex::encode(digest)[..FINGERPRINT_HEX_CHARS].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::capture::Inspect;

    fn test_config() -> Arc<AgentConfig> {
        let settings = Settings {
            api_key: Some("test-key".to_string()),
            ..Default::default()
        };
        Arc::new(AgentConfig::from_settings(&settings).unwrap())
    }

    fn user_frame(method: &str, line: Option<u32>) -> StackFrame {
        StackFrame {
            method_name: method.to_string(),
            file_path: Some("/app/src/main.rs".to_string()),
            file_name: Some("main.rs".to_string()),
            line_number: line,
            class_name: None,
            is_native: false,
            source_available: true,
        }
    }

    fn native_frame(method: &str) -> StackFrame {
        StackFrame {
            method_name: method.to_string(),
            file_path: Some("<intrinsic>".to_string()),
            file_name: Some("<intrinsic>".to_string()),
            line_number: None,
            class_name: None,
            is_native: true,
            source_available: false,
        }
    }

    #[test]
    fn test_fingerprint_shape() {
        let fp = fingerprint("KeyError", &[user_frame("lookup", Some(10))]);
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_fingerprint_deterministic_and_sensitive() {
        let frames = vec![user_frame("lookup", Some(10)), user_frame("serve", Some(30))];
        let a = fingerprint("KeyError", &frames);
        let b = fingerprint("KeyError", &frames);
        assert_eq!(a, b);

        let moved = vec![user_frame("lookup", Some(11)), user_frame("serve", Some(30))];
        assert_ne!(a, fingerprint("KeyError", &moved));
        assert_ne!(a, fingerprint("ValueError", &frames));
    }

    #[test]
    fn test_fingerprint_skips_native_and_caps_at_five() {
        let with_native = vec![
            native_frame("raise"),
            user_frame("lookup", Some(10)),
            user_frame("serve", Some(30)),
        ];
        let without_native = vec![user_frame("lookup", Some(10)), user_frame("serve", Some(30))];
        assert_eq!(
            fingerprint("KeyError", &with_native),
            fingerprint("KeyError", &without_native)
        );

        // Frames past the fifth non-native one do not contribute.
        let mut six: Vec<StackFrame> = (0..6).map(|i| user_frame("f", Some(i))).collect();
        let base = fingerprint("E", &six);
        six[5].line_number = Some(99);
        assert_eq!(base, fingerprint("E", &six));
    }

    #[test]
    fn test_fingerprint_missing_line_renders_zero() {
        let a = fingerprint("E", &[user_frame("f", None)]);
        let b = fingerprint("E", &[user_frame("f", Some(0))]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_capture_merges_context_with_override_precedence() {
        let config = test_config();
        let mut base = Map::new();
        base.insert("region".to_string(), Value::String("eu".to_string()));
        base.insert("tier".to_string(), Value::String("free".to_string()));
        config.set_custom_context(base);
        config.set_user(Some("u1"), None, None);

        let builder = ExceptionCaptureBuilder::new(config);
        let mut overrides = Map::new();
        overrides.insert("tier".to_string(), Value::String("pro".to_string()));
        let capture = builder.capture(
            &ExceptionInfo::new("ValueError", "bad input"),
            Some(overrides),
            None,
        );

        assert_eq!(capture.context.get("region").and_then(|v| v.as_str()), Some("eu"));
        assert_eq!(capture.context.get("tier").and_then(|v| v.as_str()), Some("pro"));
        assert_eq!(
            capture.context.get("user").and_then(|v| v.get("id")).and_then(|v| v.as_str()),
            Some("u1")
        );
    }

    #[test]
    fn test_capture_user_defaults_to_empty_map() {
        let builder = ExceptionCaptureBuilder::new(test_config());
        let capture = builder.capture(&ExceptionInfo::new("E", "m"), None, None);
        assert_eq!(
            capture.context.get("user"),
            Some(&Value::Object(Map::new()))
        );
    }

    #[test]
    fn test_capture_timestamp_is_utc_with_z_suffix() {
        let builder = ExceptionCaptureBuilder::new(test_config());
        let capture = builder.capture(&ExceptionInfo::new("E", "m"), None, None);
        assert!(capture.captured_at.ends_with('Z'));
        assert!(capture.captured_at.contains('T'));
    }

    #[test]
    fn test_capture_with_frame_uses_frame_and_locals() {
        let builder = ExceptionCaptureBuilder::new(test_config());
        let a = 100i64;
        let b = 0i64;
        let locals: [(&str, &dyn Inspect); 2] = [("a", &a), ("b", &b)];
        let frame = FrameContext {
            method_name: "divide",
            class_name: None,
            file_path: "/app/src/math.rs",
            line_number: 12,
            locals: &locals,
        };
        let capture = builder.capture(
            &ExceptionInfo::new("ZeroDivisionError", "division by zero"),
            None,
            Some(&frame),
        );
        assert!(!capture.stack_trace.is_empty());
        assert_eq!(capture.stack_trace[0].line_number, Some(12));
        assert_eq!(capture.local_variables["a"].value, "100");
        assert_eq!(capture.local_variables["b"].value, "0");
    }

    #[test]
    fn test_capture_without_frame_falls_back_to_backtrace() {
        let builder = ExceptionCaptureBuilder::new(test_config());
        let capture = builder.capture(&ExceptionInfo::new("E", "m"), None, None);
        assert!(!capture.stack_trace.is_empty());
        assert!(capture.local_variables.is_empty());
    }

    #[test]
    fn test_exception_info_from_error() {
        #[derive(Debug)]
        struct KeyError(String);
        impl std::fmt::Display for KeyError {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "key {:?} not found", self.0)
            }
        }
        impl std::error::Error for KeyError {}

        let info = ExceptionInfo::from_error(&KeyError("b".to_string()));
        assert_eq!(info.exception_type, "KeyError");
        assert!(info.message.contains("b"));
    }
}
