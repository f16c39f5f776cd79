//! In-memory form of every value the store can hold.

use crate::{Error, Result};
use ewald_core::{NzArray1, NzArray2, ScanTable, Series};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Tag written to the `encoded` attribute of every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    None,
    Dict,
    Str,
    Series,
    DataFrame,
    Scalar,
    Arr,
    Yaml,
    Json,
    Unknown,
    NzArray,
}

impl Encoding {
    /// Tag text as stored on disk.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Dict => "dict",
            Self::Str => "str",
            Self::Series => "Series",
            Self::DataFrame => "DataFrame",
            Self::Scalar => "scalar",
            Self::Arr => "arr",
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Unknown => "unknown",
            Self::NzArray => "nzarray",
        }
    }

    /// Whether the node is a group rather than a dataset.
    #[must_use]
    pub fn is_group(self) -> bool {
        matches!(
            self,
            Self::Dict | Self::Series | Self::DataFrame | Self::NzArray
        )
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "None" => Self::None,
            "dict" => Self::Dict,
            "str" => Self::Str,
            "Series" => Self::Series,
            "DataFrame" => Self::DataFrame,
            "scalar" => Self::Scalar,
            "arr" => Self::Arr,
            "yaml" => Self::Yaml,
            "json" => Self::Json,
            "unknown" => Self::Unknown,
            "nzarray" => Self::NzArray,
            other => return Err(Error::Encoding(format!("unknown tag '{other}'"))),
        })
    }
}

/// Text serialization used for values without a native layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextFormat {
    #[default]
    Json,
    Yaml,
}

impl TextFormat {
    pub(crate) fn encoding(self) -> Encoding {
        match self {
            Self::Json => Encoding::Json,
            Self::Yaml => Encoding::Yaml,
        }
    }
}

/// Scalar dataset value. The stored dtype selects the variant on read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl Scalar {
    /// Numeric value; `true` is `1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Float(v) => v,
            Self::Int(v) => v as f64,
            Self::Bool(v) => f64::from(u8::from(v)),
        }
    }

    /// Truthiness: non-zero numbers are `true`.
    #[must_use]
    pub fn as_bool(self) -> bool {
        match self {
            Self::Bool(v) => v,
            Self::Int(v) => v != 0,
            Self::Float(v) => v != 0.0,
        }
    }
}

/// A value paired with the layout it is stored with.
#[derive(Debug, Clone, PartialEq)]
pub enum H5Value {
    None,
    Dict(BTreeMap<String, H5Value>),
    Str(String),
    Series(Series),
    DataFrame(ScanTable),
    Scalar(Scalar),
    Array(ArrayD<f64>),
    IntArray(ArrayD<i64>),
    StrArray(Vec<String>),
    NzArray1(NzArray1),
    NzArray2(NzArray2),
    /// Serialized text of a value with no native layout.
    Text { format: TextFormat, text: String },
    /// `Debug` repr of a value that could not be serialized.
    Unknown(String),
}

impl H5Value {
    /// Tag the value is written with.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        match self {
            Self::None => Encoding::None,
            Self::Dict(_) => Encoding::Dict,
            Self::Str(_) => Encoding::Str,
            Self::Series(_) => Encoding::Series,
            Self::DataFrame(_) => Encoding::DataFrame,
            Self::Scalar(_) => Encoding::Scalar,
            Self::Array(_) | Self::IntArray(_) | Self::StrArray(_) => Encoding::Arr,
            Self::NzArray1(_) | Self::NzArray2(_) => Encoding::NzArray,
            Self::Text { format, .. } => format.encoding(),
            Self::Unknown(_) => Encoding::Unknown,
        }
    }

    /// Builds a value from parsed JSON.
    ///
    /// Homogeneous numeric lists (nested lists of equal length included)
    /// become arrays; string lists become string arrays; any other list is
    /// kept as JSON text.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::None,
            Value::Bool(b) => Self::Scalar(Scalar::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Scalar(Scalar::Int(i)),
                None => Self::Scalar(Scalar::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            Value::String(s) => Self::Str(s.clone()),
            Value::Object(map) => Self::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
            Value::Array(items) => list_from_json(items).unwrap_or_else(|| Self::Text {
                format: TextFormat::Json,
                text: value.to_string(),
            }),
        }
    }

    /// Converts back to JSON.
    ///
    /// # Errors
    /// Returns an error for tables, sparse arrays and unknown reprs, which
    /// have no JSON form.
    pub fn to_json(&self) -> Result<Value> {
        Ok(match self {
            Self::None => Value::Null,
            Self::Dict(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json()?);
                }
                Value::Object(out)
            }
            Self::Str(s) => Value::String(s.clone()),
            Self::Scalar(Scalar::Bool(b)) => Value::Bool(*b),
            Self::Scalar(Scalar::Int(i)) => Value::from(*i),
            Self::Scalar(Scalar::Float(f)) => float_json(*f),
            Self::Array(a) => array_json(&a.view(), &|v: &f64| float_json(*v)),
            Self::IntArray(a) => array_json(&a.view(), &|v: &i64| Value::from(*v)),
            Self::StrArray(v) => Value::Array(v.iter().cloned().map(Value::String).collect()),
            Self::Text {
                format: TextFormat::Json,
                text,
            } => serde_json::from_str(text)?,
            Self::Text {
                format: TextFormat::Yaml,
                text,
            } => serde_yaml::from_str(text)?,
            Self::Series(_)
            | Self::DataFrame(_)
            | Self::NzArray1(_)
            | Self::NzArray2(_)
            | Self::Unknown(_) => {
                return Err(Error::Encoding(format!(
                    "{} node has no JSON form",
                    self.encoding()
                )))
            }
        })
    }

    /// Entry `key` of a dict value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&H5Value> {
        match self {
            Self::Dict(map) => map.get(key),
            _ => None,
        }
    }
}

impl From<f64> for H5Value {
    fn from(v: f64) -> Self {
        Self::Scalar(Scalar::Float(v))
    }
}

impl From<i64> for H5Value {
    fn from(v: i64) -> Self {
        Self::Scalar(Scalar::Int(v))
    }
}

impl From<bool> for H5Value {
    fn from(v: bool) -> Self {
        Self::Scalar(Scalar::Bool(v))
    }
}

impl From<&str> for H5Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for H5Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl<T: Into<H5Value>> From<Option<T>> for H5Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::None, Into::into)
    }
}

fn float_json(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn array_json<T, F>(view: &ArrayViewD<'_, T>, leaf: &F) -> Value
where
    F: Fn(&T) -> Value,
{
    match view.ndim() {
        0 => view.iter().next().map_or(Value::Null, leaf),
        1 => Value::Array(view.iter().map(leaf).collect()),
        _ => Value::Array(
            view.axis_iter(Axis(0))
                .map(|sub| array_json(&sub, leaf))
                .collect(),
        ),
    }
}

enum Leaf {
    Int(i64),
    Float(f64),
}

/// Shape of a nested list, read along its first elements.
fn nested_shape(items: &[Value]) -> Vec<usize> {
    let mut shape = vec![items.len()];
    let mut first = items.first();
    while let Some(Value::Array(sub)) = first {
        shape.push(sub.len());
        first = sub.first();
    }
    shape
}

/// Collects the leaves of a rectangular numeric list of the given shape.
fn flatten(items: &[Value], shape: &[usize], out: &mut Vec<Leaf>) -> bool {
    let Some((&len, rest)) = shape.split_first() else {
        return false;
    };
    if items.len() != len {
        return false;
    }
    items.iter().all(|item| match (item, rest.is_empty()) {
        (Value::Number(n), true) => {
            out.push(match n.as_i64() {
                Some(i) => Leaf::Int(i),
                None => Leaf::Float(n.as_f64().unwrap_or(f64::NAN)),
            });
            true
        }
        (Value::Array(sub), false) => flatten(sub, rest, out),
        _ => false,
    })
}

#[allow(clippy::cast_precision_loss)]
fn list_from_json(items: &[Value]) -> Option<H5Value> {
    if items.is_empty() {
        return Some(H5Value::Array(ArrayD::zeros(IxDyn(&[0]))));
    }
    if items.iter().all(Value::is_string) {
        return Some(H5Value::StrArray(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ));
    }
    let shape = nested_shape(items);
    let mut leaves = Vec::new();
    if !flatten(items, &shape, &mut leaves) {
        return None;
    }
    if leaves.iter().all(|l| matches!(l, Leaf::Int(_))) {
        let data = leaves
            .iter()
            .map(|l| match l {
                Leaf::Int(i) => *i,
                Leaf::Float(_) => 0,
            })
            .collect();
        return ArrayD::from_shape_vec(IxDyn(&shape), data)
            .ok()
            .map(H5Value::IntArray);
    }
    let data = leaves
        .iter()
        .map(|l| match l {
            Leaf::Int(i) => *i as f64,
            Leaf::Float(f) => *f,
        })
        .collect();
    ArrayD::from_shape_vec(IxDyn(&shape), data)
        .ok()
        .map(H5Value::Array)
}
