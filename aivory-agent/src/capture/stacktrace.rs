// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Captured call chains never exceed this many frames.
pub const MAX_STACK_FRAMES: usize = 50;

/// Path segments that mark a frame as third-party: code the operator cannot
/// edit even though the file exists on disk.
const VENDORED_PATH_SEGMENTS: &[&str] = &[".cargo/registry", ".cargo/git", "/rustc/"];

/// One entry of a captured call chain, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub method_name: String,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub class_name: Option<String>,
    pub is_native: bool,
    pub source_available: bool,
}

/// Returns `(is_native, source_available)` for a frame's file path. A path is
/// native when it does not name a real file (missing, or a synthetic `<...>`
/// marker); it is source-available when it is real and not vendored.
pub(crate) fn classify_path(path: Option<&str>) -> (bool, bool) {
    match path {
        None => (true, false),
        Some(path) => {
            let is_native = path.starts_with('<');
            let source_available =
                !is_native && !VENDORED_PATH_SEGMENTS.iter().any(|seg| path.contains(seg));
            (is_native, source_available)
        }
    }
}

pub(crate) fn file_name_of(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

/// Splits a demangled symbol into `(method_name, class_name)`.
///
/// `mycrate::checkout::Cart::total::h1f2e3d4c` yields `("total", Some("Cart"))`.
fn split_symbol(symbol: Option<&str>) -> (String, Option<String>) {
    let Some(symbol) = symbol else {
        return ("<unknown>".to_string(), None);
    };
    let mut segments: Vec<&str> = symbol.split("::").collect();
    // Trailing hash segment added by the compiler, e.g. "h1f2e3d4c5b6a7f8e".
    if let Some(last) = segments.last() {
        if last.len() == 17
            && last.starts_with('h')
            && last[1..].bytes().all(|b| b.is_ascii_hexdigit())
        {
            segments.pop();
        }
    }
    let method = segments.pop().unwrap_or(symbol).to_string();
    let class = segments
        .last()
        .filter(|seg| seg.chars().next().is_some_and(char::is_uppercase))
        .map(|seg| seg.to_string());
    (method, class)
}

/// Builds a frame chain from a resolved backtrace, innermost first.
pub fn frames_from_backtrace(backtrace: &backtrace::Backtrace) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            if frames.len() >= MAX_STACK_FRAMES {
                return frames;
            }
            let name = symbol.name().map(|name| name.to_string());
            let (method_name, class_name) = split_symbol(name.as_deref());
            let file_path = symbol
                .filename()
                .map(|path| path.to_string_lossy().into_owned());
            let (is_native, source_available) = classify_path(file_path.as_deref());
            frames.push(StackFrame {
                method_name,
                file_name: file_path.as_deref().map(file_name_of),
                file_path,
                line_number: symbol.lineno(),
                class_name,
                is_native,
                source_available,
            });
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_path() {
        let cases = [
            (None, (true, false)),
            (Some("<jit>"), (true, false)),
            (Some("/app/src/main.rs"), (false, true)),
            (
                Some("/home/u/.cargo/registry/src/index/serde-1.0/src/de.rs"),
                (false, false),
            ),
            (Some("/rustc/abc123/library/core/src/panic.rs"), (false, false)),
            (Some("/home/u/.cargo/git/checkouts/dep/src/lib.rs"), (false, false)),
        ];
        for (path, expected) in cases {
            assert_eq!(classify_path(path), expected, "path: {path:?}");
        }
    }

    #[test]
    fn test_file_name_of() {
        assert_eq!(file_name_of("/app/src/main.rs"), "main.rs");
        assert_eq!(file_name_of("C:\\app\\src\\main.rs"), "main.rs");
        assert_eq!(file_name_of("main.rs"), "main.rs");
    }

    #[test]
    fn test_split_symbol() {
        let (method, class) = split_symbol(Some("mycrate::checkout::Cart::total::h1f2e3d4c5b6a7f8e"));
        assert_eq!(method, "total");
        assert_eq!(class, Some("Cart".to_string()));

        let (method, class) = split_symbol(Some("mycrate::checkout::compute"));
        assert_eq!(method, "compute");
        assert_eq!(class, None);

        let (method, class) = split_symbol(None);
        assert_eq!(method, "<unknown>");
        assert_eq!(class, None);
    }

    #[test]
    fn test_frames_from_backtrace_bounded_and_consistent() {
        let backtrace = backtrace::Backtrace::new();
        let frames = frames_from_backtrace(&backtrace);
        assert!(!frames.is_empty());
        assert!(frames.len() <= MAX_STACK_FRAMES);
        for frame in &frames {
            if frame.file_path.is_none() {
                assert!(frame.is_native);
                assert!(!frame.source_available);
            }
            if frame.source_available {
                assert!(!frame.is_native);
            }
        }
    }
}
