// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

use crate::capture::{ExceptionCaptureBuilder, ExceptionInfo};
use crate::config::AgentConfig;
use crate::log::agent_log;
use crate::tracer::FrameContext;
use crate::transport::BackendConnection;
use aivory_common::MutexExt;
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe, PanicHookInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;

/// Installs the process-wide uncaught-failure hook (the panic hook slot) and
/// exposes the manual capture entry points.
pub struct ExceptionHandler {
    config: Arc<AgentConfig>,
    connection: BackendConnection,
    builder: Arc<ExceptionCaptureBuilder>,
    installed: AtomicBool,
    previous: Arc<Mutex<Option<PanicHook>>>,
}

impl ExceptionHandler {
    pub fn new(config: Arc<AgentConfig>, connection: BackendConnection) -> Self {
        let builder = Arc::new(ExceptionCaptureBuilder::new(Arc::clone(&config)));
        ExceptionHandler {
            config,
            connection,
            builder,
            installed: AtomicBool::new(false),
            previous: Arc::new(Mutex::new(None)),
        }
    }

    /// Saves the current panic hook and installs the reporting hook in its
    /// place. Idempotent.
    pub fn install(&self) {
        if self.installed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.previous.lock_or_panic() = Some(std::panic::take_hook());

        let config = Arc::clone(&self.config);
        let connection = self.connection.clone();
        let builder = Arc::clone(&self.builder);
        let previous = Arc::clone(&self.previous);
        std::panic::set_hook(Box::new(move |info| {
            let report = catch_unwind(AssertUnwindSafe(|| {
                if config.should_sample() {
                    let exception = ExceptionInfo::from_panic(info);
                    let mut context = Map::new();
                    context.insert(
                        "origin".to_string(),
                        Value::String("uncaught".to_string()),
                    );
                    let capture = builder.capture(&exception, Some(context), None);
                    connection.send_exception(capture);
                }
            }));
            if report.is_err() {
                agent_log!(config, DEBUG, "error capturing panic");
            }
            // The saved hook runs regardless of whether reporting succeeded.
            if let Some(previous) = previous.lock_or_panic().as_ref() {
                previous(info);
            }
        }));

        agent_log!(self.config, DEBUG, "exception handler installed");
    }

    /// Restores the saved hook. Idempotent.
    pub fn uninstall(&self) {
        if !self.installed.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.previous.lock_or_panic().take() {
            Some(previous) => std::panic::set_hook(previous),
            None => {
                let _ = std::panic::take_hook();
            }
        }
    }

    /// Manually capture `error` with optional per-call context.
    pub fn capture<E: std::error::Error + ?Sized>(
        &self,
        error: &E,
        context: Option<Map<String, Value>>,
    ) {
        self.report(&ExceptionInfo::from_error(error), context, None);
    }

    /// Capture `error` together with the innermost frame as seen by the
    /// caller, locals included.
    pub fn capture_with_frame<E: std::error::Error + ?Sized>(
        &self,
        error: &E,
        context: Option<Map<String, Value>>,
        frame: &FrameContext<'_>,
    ) {
        self.report(&ExceptionInfo::from_error(error), context, Some(frame));
    }

    /// Reports an error the application had to swallow (for example inside a
    /// `Drop` impl, where nothing can propagate).
    pub fn capture_suppressed<E: std::error::Error + ?Sized>(&self, error: &E, note: &str) {
        let mut context = Map::new();
        context.insert(
            "origin".to_string(),
            Value::String("unraisable".to_string()),
        );
        context.insert("err_msg".to_string(), Value::String(note.to_string()));
        self.report(&ExceptionInfo::from_error(error), Some(context), None);
    }

    fn report(
        &self,
        exception: &ExceptionInfo,
        context: Option<Map<String, Value>>,
        frame: Option<&FrameContext<'_>>,
    ) {
        if !self.config.should_sample() {
            return;
        }
        let capture = self.builder.capture(exception, context, frame);
        self.connection.send_exception(capture);
    }
}

impl Drop for ExceptionHandler {
    fn drop(&mut self) {
        self.uninstall();
    }
}

/// The panic hook slot is process-global; tests that touch it must not
/// overlap.
#[cfg(test)]
pub(crate) static HOOK_TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::sync::atomic::AtomicUsize;

    fn handler() -> ExceptionHandler {
        let config = Arc::new(
            AgentConfig::from_settings(&Settings {
                api_key: Some("test-key".to_string()),
                ..Default::default()
            })
            .unwrap(),
        );
        let connection = BackendConnection::new(Arc::clone(&config));
        ExceptionHandler::new(config, connection)
    }

    #[test]
    fn test_install_uninstall_idempotent_and_chaining() {
        let _guard = HOOK_TEST_LOCK.lock().unwrap();

        let invocations = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&invocations);
        std::panic::set_hook(Box::new(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        let handler = handler();
        handler.install();
        handler.install();

        // The user hook still runs, via chaining, exactly once per panic.
        let result = catch_unwind(|| panic!("kaboom"));
        assert!(result.is_err());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        // After uninstall the saved hook is active again.
        handler.uninstall();
        handler.uninstall();
        let result = catch_unwind(|| panic!("again"));
        assert!(result.is_err());
        assert_eq!(invocations.load(Ordering::SeqCst), 2);

        let _ = std::panic::take_hook();
    }

    #[test]
    fn test_capture_does_not_panic_without_transport() {
        #[derive(Debug)]
        struct Boom;
        impl std::fmt::Display for Boom {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("boom")
            }
        }
        impl std::error::Error for Boom {}

        let handler = handler();
        handler.capture(&Boom, None);
        handler.capture_suppressed(&Boom, "error in drop glue");
    }
}
