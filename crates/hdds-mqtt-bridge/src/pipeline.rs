// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic-to-point translation pipeline.
//!
//! ```text
//! (topic, payload) --> PatternRegistry --> interpret --> PointBuilder --> Point
//!                          |
//!                          +--> None (unmatched)
//! ```
//!
//! The translator holds only immutable state and can be shared between
//! workers behind an `Arc`.

use crate::pattern::PatternRegistry;
use crate::payload::interpret;
use crate::point::{Point, PointBuilder};

/// Stateless topic-to-point translator.
#[derive(Debug, Clone)]
pub struct Translator {
    registry: PatternRegistry,
    builder: PointBuilder,
}

impl Translator {
    pub fn new(registry: PatternRegistry, builder: PointBuilder) -> Self {
        Self { registry, builder }
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    /// Translate one message. Returns `None` when no pattern matches.
    pub fn translate(&self, topic: &str, payload: &[u8]) -> Option<Point> {
        let matched = self.registry.match_topic(topic)?;
        let value = interpret(payload);
        Some(self.builder.build(matched, value))
    }
}
