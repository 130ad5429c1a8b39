// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

// Diagnostics from inside the agent must never reach the host application as
// an error; they go to `tracing` subscribers and, when `config.debug` is set,
// to standard error.
macro_rules! agent_log {
    ($config:expr, ERROR, $($arg:tt)+) => {{
        #[cfg(feature = "tracing")]
        tracing::error!($($arg)+);
        if $config.debug {
            eprintln!("[AIVory Monitor] {}", format_args!($($arg)+));
        }
    }};
    ($config:expr, DEBUG, $($arg:tt)+) => {{
        #[cfg(feature = "tracing")]
        tracing::debug!($($arg)+);
        if $config.debug {
            eprintln!("[AIVory Monitor] {}", format_args!($($arg)+));
        }
    }};
}

pub(crate) use agent_log;
