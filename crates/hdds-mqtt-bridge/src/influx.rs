// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB Line Protocol encoding.
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_ns
//! ```
//!
//! See: <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>

use std::fmt;

/// A value stored in a point field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 string.
    String(String),
}

impl FieldValue {
    /// Format this value for Line Protocol.
    ///
    /// - Float: written as-is (e.g., `18.8`)
    /// - String: double-quoted, inner quotes and backslashes escaped
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Float(_) => None,
            FieldValue::String(s) => Some(s),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line_protocol())
    }
}

/// Encode one point as a Line Protocol line.
///
/// Tags are emitted sorted by key. Fields are emitted in iteration order.
/// `fields` must not be empty; callers only pass points built by
/// [`PointBuilder`](crate::point::PointBuilder), which always carry a field.
pub fn encode_line<'t, 'f, T, F>(measurement: &str, tags: T, fields: F, timestamp_ns: u64) -> String
where
    T: IntoIterator<Item = (&'t str, &'t str)>,
    F: IntoIterator<Item = (&'f str, &'f FieldValue)>,
{
    let mut line = escape_measurement(measurement);

    let mut sorted_tags: Vec<_> = tags.into_iter().collect();
    sorted_tags.sort_by_key(|(k, _)| *k);
    for (key, value) in sorted_tags {
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');

    for (i, (key, value)) in fields.into_iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&value.to_line_protocol());
    }

    line.push(' ');
    line.push_str(&timestamp_ns.to_string());
    line
}

/// Spaces and commas must be escaped in measurement names.
fn escape_measurement(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys share the same escaping rules.
///
/// Backslashes are doubled first so a trailing `\` cannot escape the `=`.
fn escape_key(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
