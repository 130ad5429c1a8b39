// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

mod condition;
pub mod frame;

pub use condition::BreakpointCondition;
pub use frame::{record_line, FrameContext, FrameGuard};

use crate::capture::{utc_timestamp, CaptureEngine};
use crate::config::AgentConfig;
use crate::log::agent_log;
use crate::transport::wire::{
    BreakpointCommand, BreakpointHitPayload, RemoveBreakpointPayload, SetBreakpointPayload,
};
use crate::transport::BackendConnection;
use aivory_common::MutexExt;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const MAX_HITS_CEILING: u32 = 50;

/// One active live-debugging directive. Hitting it snapshots the frame; it
/// never pauses the program.
pub struct Breakpoint {
    pub backend_id: String,
    pub file_path: String,
    pub line_number: u32,
    pub max_hits: u32,
    pub normalized_path: String,
    condition: ConditionState,
    hit_count: AtomicU32,
}

enum ConditionState {
    None,
    Ready(BreakpointCondition),
    /// The control plane sent an expression we could not parse; the
    /// breakpoint stays installed but can never fire.
    Invalid(String),
}

impl Breakpoint {
    fn new(
        backend_id: String,
        file_path: String,
        line_number: u32,
        condition: ConditionState,
        max_hits: u32,
    ) -> Self {
        let normalized_path = normalize_path(&file_path);
        Breakpoint {
            backend_id,
            file_path,
            line_number,
            max_hits: max_hits.clamp(1, MAX_HITS_CEILING),
            normalized_path,
            condition,
            hit_count: AtomicU32::new(0),
        }
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count.load(Ordering::SeqCst)
    }

    /// Claims one hit, returning the new count, or `None` once the budget is
    /// spent.
    fn claim_hit(&self) -> Option<u32> {
        self.hit_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < self.max_hits).then_some(count + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }
}

/// Lexical path normalization plus case folding, used for breakpoint
/// indexing and matching.
pub(crate) fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    let normalized = if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    };
    normalized.to_lowercase()
}

#[derive(Default)]
struct BreakpointIndex {
    by_id: HashMap<String, Arc<Breakpoint>>,
    by_file: HashMap<String, Vec<Arc<Breakpoint>>>,
}

impl BreakpointIndex {
    fn insert(&mut self, breakpoint: Arc<Breakpoint>) {
        self.remove(&breakpoint.backend_id);
        self.by_file
            .entry(breakpoint.normalized_path.clone())
            .or_default()
            .push(Arc::clone(&breakpoint));
        self.by_id
            .insert(breakpoint.backend_id.clone(), breakpoint);
    }

    fn remove(&mut self, backend_id: &str) -> Option<Arc<Breakpoint>> {
        let breakpoint = self.by_id.remove(backend_id)?;
        if let Some(list) = self.by_file.get_mut(&breakpoint.normalized_path) {
            list.retain(|bp| bp.backend_id != backend_id);
            if list.is_empty() {
                self.by_file.remove(&breakpoint.normalized_path);
            }
        }
        Some(breakpoint)
    }

    fn clear(&mut self) {
        self.by_id.clear();
        self.by_file.clear();
    }

    /// A breakpoint matches when its indexed path equals the traced path or
    /// one is a suffix of the other (control planes often send relative
    /// paths). Every colliding breakpoint is returned; each applies its own
    /// condition and budget.
    fn candidates(&self, normalized: &str, line_number: u32) -> Vec<Arc<Breakpoint>> {
        self.by_file
            .iter()
            .filter(|(indexed, _)| {
                normalized.ends_with(indexed.as_str()) || indexed.ends_with(normalized)
            })
            .flat_map(|(_, list)| list.iter())
            .filter(|bp| bp.line_number == line_number)
            .cloned()
            .collect()
    }
}

/// Indexed breakpoint table plus the per-line trace callback.
pub struct TraceManager {
    config: Arc<AgentConfig>,
    connection: BackendConnection,
    engine: CaptureEngine,
    index: RwLock<BreakpointIndex>,
    armed: AtomicBool,
    enabled: AtomicBool,
    previous_hook: Mutex<Option<Option<Arc<frame::LineHook>>>>,
}

impl TraceManager {
    /// Creates the manager and registers it for breakpoint commands arriving
    /// on `connection`.
    pub fn new(config: Arc<AgentConfig>, connection: BackendConnection) -> Arc<Self> {
        let engine = CaptureEngine::new(config.limits);
        let manager = Arc::new(TraceManager {
            config,
            connection: connection.clone(),
            engine,
            index: RwLock::new(BreakpointIndex::default()),
            armed: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            previous_hook: Mutex::new(None),
        });
        let weak = Arc::downgrade(&manager);
        connection.set_breakpoint_callback(move |command, payload| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_command(command, payload);
            }
        });
        manager
    }

    /// Installs the line hook shared by every application thread (current
    /// threads and any spawned later consult the same slot). Idempotent.
    pub fn enable(self: &Arc<Self>) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let previous = frame::install_hook(Arc::new(move |context| manager.line_event(context)));
        *self.previous_hook.lock_or_panic() = Some(previous);
        agent_log!(self.config, DEBUG, "trace manager enabled");
    }

    /// Restores the previously installed hook and clears both indexes.
    /// Idempotent.
    pub fn disable(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(previous) = self.previous_hook.lock_or_panic().take() {
            frame::restore_hook(previous);
        }
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.armed.store(false, Ordering::SeqCst);
        agent_log!(self.config, DEBUG, "trace manager disabled");
    }

    /// Installs a breakpoint. A repeated `backend_id` replaces the previous
    /// breakpoint and resets its hit count.
    pub fn set_breakpoint(
        &self,
        backend_id: &str,
        file_path: &str,
        line_number: u32,
        condition: Option<&str>,
        max_hits: u32,
    ) {
        let condition = match condition {
            None => ConditionState::None,
            Some(source) => match BreakpointCondition::parse(source) {
                Ok(parsed) => ConditionState::Ready(parsed),
                Err(err) => {
                    agent_log!(self.config, DEBUG, "invalid breakpoint condition: {err:#}");
                    ConditionState::Invalid(source.to_string())
                }
            },
        };
        let breakpoint = Arc::new(Breakpoint::new(
            backend_id.to_string(),
            file_path.to_string(),
            line_number,
            condition,
            max_hits,
        ));
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        index.insert(breakpoint);
        self.armed.store(true, Ordering::SeqCst);
        drop(index);
        agent_log!(
            self.config,
            DEBUG,
            "breakpoint set: {backend_id} at {file_path}:{line_number}"
        );
    }

    pub fn remove_breakpoint(&self, backend_id: &str) {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if index.remove(backend_id).is_some() {
            self.armed.store(!index.by_file.is_empty(), Ordering::SeqCst);
            drop(index);
            agent_log!(self.config, DEBUG, "breakpoint removed: {backend_id}");
        }
    }

    pub fn breakpoint(&self, backend_id: &str) -> Option<Arc<Breakpoint>> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(backend_id)
            .cloned()
    }

    fn handle_command(&self, command: BreakpointCommand, payload: serde_json::Value) {
        match command {
            BreakpointCommand::Set => {
                let payload: SetBreakpointPayload =
                    serde_json::from_value(payload).unwrap_or_default();
                self.set_breakpoint(
                    &payload.id,
                    &payload.file_path,
                    payload.line_number,
                    payload.condition.as_deref(),
                    payload.max_hits.unwrap_or(1),
                );
            }
            BreakpointCommand::Remove => {
                let payload: RemoveBreakpointPayload =
                    serde_json::from_value(payload).unwrap_or_default();
                self.remove_breakpoint(&payload.id);
            }
        }
    }

    /// The per-line trace callback. Must never raise into the traced thread.
    pub(crate) fn line_event(&self, context: &FrameContext<'_>) {
        let _ = catch_unwind(AssertUnwindSafe(|| self.line_event_inner(context)));
    }

    fn line_event_inner(&self, context: &FrameContext<'_>) {
        if !self.armed.load(Ordering::SeqCst) {
            return;
        }
        let normalized = normalize_path(context.file_path);
        let matched = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .candidates(&normalized, context.line_number);

        for breakpoint in matched {
            self.handle_breakpoint_hit(&breakpoint, context);
        }
    }

    fn handle_breakpoint_hit(&self, breakpoint: &Breakpoint, context: &FrameContext<'_>) {
        if breakpoint.hit_count() >= breakpoint.max_hits {
            return;
        }
        match &breakpoint.condition {
            ConditionState::None => {}
            ConditionState::Invalid(source) => {
                agent_log!(self.config, DEBUG, "skipping unparseable condition {source:?}");
                return;
            }
            ConditionState::Ready(condition) => match condition.evaluate(context.locals) {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    agent_log!(self.config, DEBUG, "condition eval error: {err:#}");
                    return;
                }
            },
        }
        let Some(hit_count) = breakpoint.claim_hit() else {
            return;
        };
        agent_log!(self.config, DEBUG, "breakpoint hit: {}", breakpoint.backend_id);

        let local_variables = self.engine.capture_locals(context.locals);
        let mut stack_trace = frame::traced_stack();
        if stack_trace.is_empty() {
            stack_trace.push(frame::stack_frame_from_context(context));
        }

        self.connection.send_breakpoint_hit(BreakpointHitPayload {
            breakpoint_id: breakpoint.backend_id.clone(),
            agent_id: self.config.agent_id.clone(),
            captured_at: utc_timestamp(),
            file_path: breakpoint.file_path.clone(),
            line_number: breakpoint.line_number,
            stack_trace,
            local_variables,
            hit_count,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Inspect;
    use crate::config::Settings;

    fn manager() -> Arc<TraceManager> {
        let config = Arc::new(
            AgentConfig::from_settings(&Settings {
                api_key: Some("test-key".to_string()),
                ..Default::default()
            })
            .unwrap(),
        );
        let connection = BackendConnection::new(Arc::clone(&config));
        TraceManager::new(config, connection)
    }

    fn line(manager: &TraceManager, file_path: &str, line_number: u32, i: i64) {
        let locals: [(&str, &dyn Inspect); 1] = [("i", &i)];
        manager.line_event(&FrameContext {
            method_name: "step",
            class_name: None,
            file_path,
            line_number,
            locals: &locals,
        });
    }

    #[test]
    fn test_normalize_path() {
        let cases = [
            ("/App/./Src/../src/Main.rs", "/app/src/main.rs"),
            ("C:\\App\\Src\\main.rs", "c:/app/src/main.rs"),
            ("src/main.rs", "src/main.rs"),
            ("./x.rs", "x.rs"),
            ("", "."),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_path(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_max_hits_clamped() {
        let bp = Breakpoint::new("b".into(), "/a.rs".into(), 1, ConditionState::None, 500);
        assert_eq!(bp.max_hits, 50);
        let bp = Breakpoint::new("b".into(), "/a.rs".into(), 1, ConditionState::None, 0);
        assert_eq!(bp.max_hits, 1);
    }

    #[test]
    fn test_hit_budget() {
        let manager = manager();
        manager.set_breakpoint("bp-1", "/app/src/job.rs", 10, None, 3);
        for _ in 0..10 {
            line(&manager, "/app/src/job.rs", 10, 0);
        }
        let bp = manager.breakpoint("bp-1").unwrap();
        assert_eq!(bp.hit_count(), 3);
    }

    #[test]
    fn test_condition_gates_hits() {
        let manager = manager();
        manager.set_breakpoint("bp-c", "/app/src/job.rs", 10, Some("i == 3"), 5);
        for i in 0..10 {
            line(&manager, "/app/src/job.rs", 10, i);
        }
        assert_eq!(manager.breakpoint("bp-c").unwrap().hit_count(), 1);
    }

    #[test]
    fn test_invalid_condition_never_fires() {
        let manager = manager();
        manager.set_breakpoint("bp-x", "/app/src/job.rs", 10, Some("i =="), 5);
        for i in 0..10 {
            line(&manager, "/app/src/job.rs", 10, i);
        }
        assert_eq!(manager.breakpoint("bp-x").unwrap().hit_count(), 0);
    }

    #[test]
    fn test_condition_error_is_a_non_hit() {
        let manager = manager();
        manager.set_breakpoint("bp-e", "/app/src/job.rs", 10, Some("ghost == 1"), 5);
        line(&manager, "/app/src/job.rs", 10, 1);
        assert_eq!(manager.breakpoint("bp-e").unwrap().hit_count(), 0);
    }

    #[test]
    fn test_suffix_path_matching() {
        let manager = manager();
        // Relative path installed by the control plane matches an absolute
        // traced path, and vice versa.
        manager.set_breakpoint("bp-rel", "src/job.rs", 10, None, 5);
        manager.set_breakpoint("bp-abs", "/srv/app/src/job.rs", 10, None, 5);
        line(&manager, "/srv/app/src/job.rs", 10, 0);
        assert_eq!(manager.breakpoint("bp-rel").unwrap().hit_count(), 1);
        assert_eq!(manager.breakpoint("bp-abs").unwrap().hit_count(), 1);
        line(&manager, "src/job.rs", 10, 0);
        assert_eq!(manager.breakpoint("bp-abs").unwrap().hit_count(), 2);
    }

    #[test]
    fn test_line_mismatch_does_not_hit() {
        let manager = manager();
        manager.set_breakpoint("bp-1", "/app/src/job.rs", 10, None, 5);
        line(&manager, "/app/src/job.rs", 11, 0);
        assert_eq!(manager.breakpoint("bp-1").unwrap().hit_count(), 0);
    }

    #[test]
    fn test_replacing_breakpoint_resets_hit_count() {
        let manager = manager();
        manager.set_breakpoint("bp-1", "/app/src/job.rs", 10, None, 5);
        line(&manager, "/app/src/job.rs", 10, 0);
        assert_eq!(manager.breakpoint("bp-1").unwrap().hit_count(), 1);
        manager.set_breakpoint("bp-1", "/app/src/job.rs", 10, None, 5);
        assert_eq!(manager.breakpoint("bp-1").unwrap().hit_count(), 0);
    }

    #[test]
    fn test_remove_breakpoint() {
        let manager = manager();
        manager.set_breakpoint("bp-1", "/app/src/job.rs", 10, None, 5);
        manager.remove_breakpoint("bp-1");
        assert!(manager.breakpoint("bp-1").is_none());
        line(&manager, "/app/src/job.rs", 10, 0);
    }

    #[test]
    fn test_command_payload_dispatch() {
        let manager = manager();
        manager.handle_command(
            BreakpointCommand::Set,
            serde_json::json!({
                "id": "bp-9",
                "file_path": "/app/src/job.rs",
                "line_number": 22,
                "condition": "i > 1",
                "max_hits": 99,
            }),
        );
        let bp = manager.breakpoint("bp-9").unwrap();
        assert_eq!(bp.line_number, 22);
        assert_eq!(bp.max_hits, 50);

        manager.handle_command(
            BreakpointCommand::Remove,
            serde_json::json!({"id": "bp-9"}),
        );
        assert!(manager.breakpoint("bp-9").is_none());
    }
}
