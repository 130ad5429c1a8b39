// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

//! The execution-tracing facility. Instrumented code (framework adapters,
//! generated shims, tests) registers a [`FrameGuard`] per function invocation
//! and reports each traced line through [`record_line`]; the agent observes
//! those crossings through a process-wide line hook shared by every thread.

use crate::capture::stacktrace::{classify_path, file_name_of, StackFrame, MAX_STACK_FRAMES};
use crate::capture::Inspect;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Everything instrumentation knows about the currently executing line.
pub struct FrameContext<'a> {
    pub method_name: &'a str,
    pub class_name: Option<&'a str>,
    pub file_path: &'a str,
    pub line_number: u32,
    pub locals: &'a [(&'a str, &'a dyn Inspect)],
}

struct ActiveFrame {
    method_name: String,
    class_name: Option<String>,
    file_path: String,
    line_number: u32,
}

thread_local! {
    static FRAME_STACK: RefCell<Vec<ActiveFrame>> = const { RefCell::new(Vec::new()) };
}

pub(crate) type LineHook = dyn Fn(&FrameContext<'_>) + Send + Sync;

static HOOK_ARMED: AtomicBool = AtomicBool::new(false);
static LINE_HOOK: RwLock<Option<Arc<LineHook>>> = RwLock::new(None);

/// Keeps one function invocation on the per-thread frame stack for the span
/// of its scope.
pub struct FrameGuard {
    depth: usize,
}

impl FrameGuard {
    pub fn enter(method_name: &str, class_name: Option<&str>, file_path: &str) -> FrameGuard {
        FRAME_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(ActiveFrame {
                method_name: method_name.to_string(),
                class_name: class_name.map(str::to_string),
                file_path: file_path.to_string(),
                line_number: 0,
            });
            FrameGuard {
                depth: stack.len(),
            }
        })
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAME_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.truncate(self.depth.saturating_sub(1));
        });
    }
}

/// Reports one line crossing. Updates the innermost registered frame and
/// forwards the event to the installed line hook, if any.
pub fn record_line(frame: &FrameContext<'_>) {
    FRAME_STACK.with(|stack| {
        if let Some(top) = stack.borrow_mut().last_mut() {
            top.line_number = frame.line_number;
        }
    });

    if !HOOK_ARMED.load(Ordering::Acquire) {
        return;
    }
    let hook = LINE_HOOK
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(hook) = hook {
        hook(frame);
    }
}

/// Installs `hook` as the process-wide line hook, returning whatever was
/// installed before so it can be restored.
pub(crate) fn install_hook(hook: Arc<LineHook>) -> Option<Arc<LineHook>> {
    let mut slot = LINE_HOOK.write().unwrap_or_else(PoisonError::into_inner);
    let previous = slot.replace(hook);
    HOOK_ARMED.store(true, Ordering::Release);
    previous
}

pub(crate) fn restore_hook(previous: Option<Arc<LineHook>>) {
    let mut slot = LINE_HOOK.write().unwrap_or_else(PoisonError::into_inner);
    HOOK_ARMED.store(previous.is_some(), Ordering::Release);
    *slot = previous;
}

pub(crate) fn stack_frame_from_context(frame: &FrameContext<'_>) -> StackFrame {
    let (is_native, source_available) = classify_path(Some(frame.file_path));
    StackFrame {
        method_name: frame.method_name.to_string(),
        file_name: Some(file_name_of(frame.file_path)),
        file_path: Some(frame.file_path.to_string()),
        line_number: Some(frame.line_number),
        class_name: frame.class_name.map(str::to_string),
        is_native,
        source_available,
    }
}

/// Snapshot of the calling thread's registered frames, innermost first.
pub(crate) fn traced_stack() -> Vec<StackFrame> {
    FRAME_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .take(MAX_STACK_FRAMES)
            .map(|frame| {
                let (is_native, source_available) = classify_path(Some(&frame.file_path));
                StackFrame {
                    method_name: frame.method_name.clone(),
                    file_name: Some(file_name_of(&frame.file_path)),
                    file_path: Some(frame.file_path.clone()),
                    line_number: Some(frame.line_number),
                    class_name: frame.class_name.clone(),
                    is_native,
                    source_available,
                }
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_nest_and_unwind() {
        let _outer = FrameGuard::enter("handle", Some("Router"), "/app/src/router.rs");
        {
            let _inner = FrameGuard::enter("lookup", None, "/app/src/table.rs");
            let stack = traced_stack();
            assert_eq!(stack.len(), 2);
            assert_eq!(stack[0].method_name, "lookup");
            assert_eq!(stack[1].method_name, "handle");
            assert_eq!(stack[1].class_name.as_deref(), Some("Router"));
        }
        assert_eq!(traced_stack().len(), 1);
    }

    #[test]
    fn test_record_line_updates_innermost_frame() {
        let _guard = FrameGuard::enter("step", None, "/app/src/job.rs");
        let frame = FrameContext {
            method_name: "step",
            class_name: None,
            file_path: "/app/src/job.rs",
            line_number: 14,
            locals: &[],
        };
        record_line(&frame);
        let stack = traced_stack();
        assert_eq!(stack[0].line_number, Some(14));
    }

    #[test]
    fn test_context_frame_classification() {
        let frame = FrameContext {
            method_name: "total",
            class_name: Some("Cart"),
            file_path: "/app/src/cart.rs",
            line_number: 8,
            locals: &[],
        };
        let converted = stack_frame_from_context(&frame);
        assert!(!converted.is_native);
        assert!(converted.source_available);
        assert_eq!(converted.file_name.as_deref(), Some("cart.rs"));
    }
}
