// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS MQTT Bridge
//!
//! Forwards sensor messages from an MQTT broker to InfluxDB.
//!
//! This crate provides:
//! - An ordered registry of topic patterns with named capture groups
//! - Payload interpretation (flat JSON objects or scalar values)
//! - Point assembly (measurement, tags, fields)
//! - InfluxDB v2 Line Protocol generation and batched writes
//! - An MQTT runtime built on `rumqttc`
//!
//! # Overview
//!
//! ```text
//! MQTT publish --> PatternRegistry --> interpret --> PointBuilder --> PointSink
//!                      |
//!                      +--> dropped (no match)
//! ```
//!
//! # Configuration File
//!
//! ```yaml
//! mqtt:
//!   host: localhost
//! influxdb:
//!   url: http://localhost:8086
//!   org: home
//!   bucket: sensors
//!   token: changeme
//! patterns:
//!   - name: sensors
//!     regex: "(?P<node_name>sensors)/(?P<room>token_pattern)/(?P<measurement_name>token_pattern)/state"
//! ```
//!
//! # Translation
//!
//! ```
//! use hdds_mqtt_bridge::{PatternRegistry, PointBuilder, TopicPattern, Translator};
//!
//! let registry = PatternRegistry::new(vec![TopicPattern::new(
//!     "weather",
//!     "(?P<node_name>weather)/(?P<measurement_name>token_pattern)",
//! )?]);
//! let translator = Translator::new(registry, PointBuilder::new());
//!
//! let point = translator.translate("weather/uv", b"0").expect("matched");
//! assert_eq!(point.to_line_protocol(1), "uv,node_name=weather value=0 1");
//! # Ok::<(), hdds_mqtt_bridge::PatternError>(())
//! ```

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod influx;
pub mod pattern;
pub mod payload;
pub mod pipeline;
pub mod point;
pub mod sink;

pub use bridge::{Bridge, BridgeError, BridgeHandle, BridgeStatsSnapshot, Outcome};
pub use config::{BridgeConfig, ConfigError, PatternConfig};
pub use influx::FieldValue;
pub use pattern::{MatchResult, PatternError, PatternRegistry, TopicPattern};
pub use payload::{coerce_numeric, interpret, PayloadValue};
pub use pipeline::Translator;
pub use point::{Point, PointBuilder};
pub use sink::{InfluxSink, LogSink, MemorySink, PointSink, SinkError};
