// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

mod builder;
pub mod stacktrace;
mod value;

pub use builder::{fingerprint, ExceptionCapture, ExceptionCaptureBuilder, ExceptionInfo};
pub(crate) use builder::utc_timestamp;
pub use stacktrace::{StackFrame, MAX_STACK_FRAMES};
pub use value::{
    Bytes, CaptureEngine, CaptureLimits, CapturedValue, Inspect, MapShape, SequenceShape, Shape,
};
