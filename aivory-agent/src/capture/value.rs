// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Display;
use std::hash::BuildHasher;

/// Bounds applied to every snapshot the capture engine produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureLimits {
    #[serde(default = "default_max_capture_depth")]
    pub max_capture_depth: u32,
    #[serde(default = "default_max_string_length")]
    pub max_string_length: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_collection_size: usize,
}

fn default_max_capture_depth() -> u32 {
    10
}
fn default_max_string_length() -> usize {
    1000
}
fn default_max_collection_size() -> usize {
    100
}

impl Default for CaptureLimits {
    fn default() -> Self {
        CaptureLimits {
            max_capture_depth: default_max_capture_depth(),
            max_string_length: default_max_string_length(),
            max_collection_size: default_max_collection_size(),
        }
    }
}

/// Map keys longer than this are cut before they become child names.
const MAX_KEY_CHARS: usize = 100;

/// One node of a bounded snapshot tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapturedValue {
    pub name: String,
    pub r#type: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "<&bool as std::ops::Not>::not")]
    pub is_null: bool,
    #[serde(default, skip_serializing_if = "<&bool as std::ops::Not>::not")]
    pub is_truncated: bool,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub children: IndexMap<String, CapturedValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub array_elements: Vec<CapturedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_length: Option<usize>,
}

impl CapturedValue {
    fn leaf(name: &str, type_name: &str, value: String) -> Self {
        CapturedValue {
            name: name.to_string(),
            r#type: type_name.to_string(),
            value,
            ..Default::default()
        }
    }
}

pub struct SequenceShape<'a> {
    pub len: usize,
    pub items: Box<dyn Iterator<Item = &'a dyn Inspect> + 'a>,
}

pub struct MapShape<'a> {
    pub len: usize,
    pub entries: Box<dyn Iterator<Item = (String, &'a dyn Inspect)> + 'a>,
}

/// The closed set of value shapes the capture engine understands.
pub enum Shape<'a> {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    Text(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
    Sequence(SequenceShape<'a>),
    Map(MapShape<'a>),
    Set(SequenceShape<'a>),
    Record(Vec<(&'static str, &'a dyn Inspect)>),
}

/// A value the agent can snapshot. Implementations expose a type name and a
/// [`Shape`]; a failing `shape()` degrades the node to a typed placeholder
/// instead of propagating into the host application.
pub trait Inspect {
    fn type_name(&self) -> Cow<'static, str>;
    fn shape(&self) -> anyhow::Result<Shape<'_>>;
}

/// Marks a buffer as a byte string so it is hex-encoded rather than captured
/// element by element.
pub struct Bytes<'a>(pub &'a [u8]);

impl Inspect for Bytes<'_> {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("bytes")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(Shape::Bytes(Cow::Borrowed(self.0)))
    }
}

macro_rules! impl_inspect_int {
    ($($ty:ty),+) => {
        $(impl Inspect for $ty {
            fn type_name(&self) -> Cow<'static, str> {
                Cow::Borrowed(stringify!($ty))
            }
            fn shape(&self) -> anyhow::Result<Shape<'_>> {
                Ok(Shape::Int(*self as i128))
            }
        })+
    };
}

impl_inspect_int!(i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

macro_rules! impl_inspect_float {
    ($($ty:ty),+) => {
        $(impl Inspect for $ty {
            fn type_name(&self) -> Cow<'static, str> {
                Cow::Borrowed(stringify!($ty))
            }
            fn shape(&self) -> anyhow::Result<Shape<'_>> {
                Ok(Shape::Float(*self as f64))
            }
        })+
    };
}

impl_inspect_float!(f32, f64);

impl Inspect for bool {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("bool")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(Shape::Bool(*self))
    }
}

impl Inspect for str {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("str")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(Shape::Text(Cow::Borrowed(self)))
    }
}

impl Inspect for String {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("String")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(Shape::Text(Cow::Borrowed(self.as_str())))
    }
}

impl Inspect for &str {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("str")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(Shape::Text(Cow::Borrowed(*self)))
    }
}

impl<T: Inspect> Inspect for Option<T> {
    fn type_name(&self) -> Cow<'static, str> {
        match self {
            Some(value) => value.type_name(),
            None => Cow::Borrowed("Option"),
        }
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        match self {
            Some(value) => value.shape(),
            None => Ok(Shape::Null),
        }
    }
}

fn sequence_shape<'a, T: Inspect + 'a, I>(len: usize, iter: I) -> Shape<'a>
where
    I: Iterator<Item = &'a T> + 'a,
{
    Shape::Sequence(SequenceShape {
        len,
        items: Box::new(iter.map(|item| item as &dyn Inspect)),
    })
}

impl<T: Inspect> Inspect for [T] {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("slice")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(sequence_shape(self.len(), self.iter()))
    }
}

impl<T: Inspect> Inspect for Vec<T> {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("Vec")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(sequence_shape(self.len(), self.iter()))
    }
}

impl<K: Display, V: Inspect, S: BuildHasher> Inspect for HashMap<K, V, S> {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("HashMap")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(Shape::Map(MapShape {
            len: self.len(),
            entries: Box::new(self.iter().map(|(k, v)| (k.to_string(), v as &dyn Inspect))),
        }))
    }
}

impl<K: Display, V: Inspect> Inspect for BTreeMap<K, V> {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("BTreeMap")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(Shape::Map(MapShape {
            len: self.len(),
            entries: Box::new(self.iter().map(|(k, v)| (k.to_string(), v as &dyn Inspect))),
        }))
    }
}

impl<T: Inspect, S: BuildHasher> Inspect for HashSet<T, S> {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("HashSet")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(match sequence_shape(self.len(), self.iter()) {
            Shape::Sequence(items) => Shape::Set(items),
            other => other,
        })
    }
}

impl<T: Inspect> Inspect for BTreeSet<T> {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("BTreeSet")
    }
    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(match sequence_shape(self.len(), self.iter()) {
            Shape::Sequence(items) => Shape::Set(items),
            other => other,
        })
    }
}

impl Inspect for serde_json::Value {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed(match self {
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "bool",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Array(_) => "array",
            serde_json::Value::Object(_) => "object",
        })
    }

    fn shape(&self) -> anyhow::Result<Shape<'_>> {
        Ok(match self {
            serde_json::Value::Null => Shape::Null,
            serde_json::Value::Bool(b) => Shape::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Shape::Int(i as i128)
                } else if let Some(u) = n.as_u64() {
                    Shape::Int(u as i128)
                } else {
                    Shape::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Shape::Text(Cow::Borrowed(s.as_str())),
            serde_json::Value::Array(items) => sequence_shape(items.len(), items.iter()),
            serde_json::Value::Object(map) => Shape::Map(MapShape {
                len: map.len(),
                entries: Box::new(map.iter().map(|(k, v)| (k.clone(), v as &dyn Inspect))),
            }),
        })
    }
}

/// Produces bounded [`CapturedValue`] trees. Traversal is read-only and never
/// propagates a failure: a value whose `shape()` errors becomes a typed
/// placeholder leaf.
#[derive(Debug, Clone, Copy)]
pub struct CaptureEngine {
    limits: CaptureLimits,
}

impl CaptureEngine {
    pub fn new(limits: CaptureLimits) -> Self {
        CaptureEngine { limits }
    }

    /// Capture the locals of one frame. Names beginning with `_` are omitted.
    pub fn capture_locals(
        &self,
        locals: &[(&str, &dyn Inspect)],
    ) -> IndexMap<String, CapturedValue> {
        let mut variables = IndexMap::new();
        for (name, value) in locals {
            if name.starts_with('_') {
                continue;
            }
            variables.insert(name.to_string(), self.capture(name, *value, 0));
        }
        variables
    }

    pub fn capture(&self, name: &str, value: &dyn Inspect, depth: u32) -> CapturedValue {
        let type_name = value.type_name();
        if depth > self.limits.max_capture_depth {
            return CapturedValue {
                is_truncated: true,
                ..CapturedValue::leaf(name, &type_name, "<max depth exceeded>".to_string())
            };
        }

        let shape = match value.shape() {
            Ok(shape) => shape,
            Err(_) => return CapturedValue::leaf(name, &type_name, format!("<{type_name}>")),
        };

        match shape {
            Shape::Null => CapturedValue {
                is_null: true,
                ..CapturedValue::leaf(name, &type_name, "null".to_string())
            },
            Shape::Bool(b) => CapturedValue::leaf(name, &type_name, b.to_string()),
            Shape::Int(i) => CapturedValue::leaf(name, &type_name, i.to_string()),
            Shape::Float(f) => CapturedValue::leaf(name, &type_name, f.to_string()),
            Shape::Text(text) => self.capture_text(name, &type_name, &text),
            Shape::Bytes(bytes) => self.capture_bytes(name, &type_name, &bytes),
            Shape::Sequence(items) => self.capture_sequence(name, &type_name, items, depth, false),
            Shape::Set(items) => self.capture_sequence(name, &type_name, items, depth, true),
            Shape::Map(entries) => self.capture_map(name, &type_name, entries, depth),
            Shape::Record(fields) => self.capture_record(name, &type_name, fields, depth),
        }
    }

    fn capture_text(&self, name: &str, type_name: &str, text: &str) -> CapturedValue {
        let display: String = text.chars().take(self.limits.max_string_length).collect();
        let truncated = display.len() < text.len();
        CapturedValue {
            is_truncated: truncated,
            ..CapturedValue::leaf(name, type_name, display)
        }
    }

    fn capture_bytes(&self, name: &str, type_name: &str, bytes: &[u8]) -> CapturedValue {
        let truncated = bytes.len() > self.limits.max_string_length;
        let kept = &bytes[..bytes.len().min(self.limits.max_string_length)];
        CapturedValue {
            is_truncated: truncated,
            ..CapturedValue::leaf(name, type_name, hex::encode(kept))
        }
    }

    fn capture_sequence(
        &self,
        name: &str,
        type_name: &str,
        shape: SequenceShape<'_>,
        depth: u32,
        count_names: bool,
    ) -> CapturedValue {
        let mut elements = Vec::new();
        for (i, item) in shape.items.take(self.limits.max_collection_size).enumerate() {
            // Sets have no stable index, so children are named by count.
            let child_name = if count_names {
                format!("[{}]", elements.len())
            } else {
                format!("[{i}]")
            };
            elements.push(self.capture(&child_name, item, depth + 1));
        }
        CapturedValue {
            array_elements: elements,
            array_length: Some(shape.len),
            is_truncated: shape.len > self.limits.max_collection_size,
            ..CapturedValue::leaf(name, type_name, format!("{type_name}[{}]", shape.len))
        }
    }

    fn capture_map(
        &self,
        name: &str,
        type_name: &str,
        shape: MapShape<'_>,
        depth: u32,
    ) -> CapturedValue {
        let mut children = IndexMap::new();
        for (key, item) in shape.entries.take(self.limits.max_collection_size) {
            let key: String = key.chars().take(MAX_KEY_CHARS).collect();
            let captured = self.capture(&key, item, depth + 1);
            children.insert(key, captured);
        }
        CapturedValue {
            children,
            is_truncated: shape.len > self.limits.max_collection_size,
            ..CapturedValue::leaf(name, type_name, format!("{type_name}[{}]", shape.len))
        }
    }

    fn capture_record(
        &self,
        name: &str,
        type_name: &str,
        fields: Vec<(&'static str, &dyn Inspect)>,
        depth: u32,
    ) -> CapturedValue {
        let public: Vec<(&'static str, &dyn Inspect)> = fields
            .into_iter()
            .filter(|(field, _)| !field.starts_with('_'))
            .collect();
        let total = public.len();
        let mut children = IndexMap::new();
        for (field, item) in public.into_iter().take(self.limits.max_collection_size) {
            children.insert(field.to_string(), self.capture(field, item, depth + 1));
        }
        CapturedValue {
            children,
            is_truncated: total > self.limits.max_collection_size,
            ..CapturedValue::leaf(name, type_name, format!("<{type_name}>"))
        }
    }
}
