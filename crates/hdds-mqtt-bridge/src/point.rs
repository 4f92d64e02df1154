// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-series points and their assembly from topic matches.

use crate::influx::{self, FieldValue};
use crate::pattern::MatchResult;
use crate::payload::{coerce_numeric, PayloadValue};
use std::collections::{BTreeMap, HashSet};

/// Field key used for scalar payloads.
pub const SCALAR_FIELD: &str = "value";

/// A time-series point without timestamp; the sink stamps it at write time.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    /// Never empty.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Point {
    /// Encode as a Line Protocol line stamped with `timestamp_ns`.
    pub fn to_line_protocol(&self, timestamp_ns: u64) -> String {
        influx::encode_line(
            &self.measurement,
            self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            self.fields.iter().map(|(k, v)| (k.as_str(), v)),
            timestamp_ns,
        )
    }

    /// Key identifying the series this point belongs to.
    pub fn series_key(&self) -> (String, BTreeMap<String, String>) {
        (self.measurement.clone(), self.tags.clone())
    }
}

/// Assembles points from a match and an interpreted payload.
///
/// Scalar payloads of measurements listed in `stringify` keep their raw text
/// instead of being coerced to a float.
#[derive(Debug, Clone, Default)]
pub struct PointBuilder {
    stringify: HashSet<String>,
}

impl PointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep scalar values of these measurements as strings.
    pub fn with_stringify<I, S>(mut self, measurements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stringify.extend(measurements.into_iter().map(Into::into));
        self
    }

    pub fn is_stringified(&self, measurement: &str) -> bool {
        self.stringify.contains(measurement)
    }

    /// Build a point. Never fails.
    pub fn build(&self, matched: MatchResult, payload: PayloadValue) -> Point {
        let fields = match payload {
            PayloadValue::Scalar(raw) => {
                let value = if self.is_stringified(&matched.measurement_name) {
                    FieldValue::String(raw)
                } else {
                    coerce_numeric(&raw)
                };
                BTreeMap::from([(SCALAR_FIELD.to_string(), value)])
            }
            PayloadValue::Structured(fields) => fields,
        };

        Point {
            measurement: matched.measurement_name,
            tags: matched.tags,
            fields,
        }
    }
}
