// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic pattern registry.
//!
//! Patterns are regular expressions with named capture groups. One group
//! names the measurement; every other named group becomes a tag. Patterns are
//! tried in declaration order and the first full match wins.
//!
//! ```text
//! weather/uv  --(?P<node_name>weather)/(?P<measurement_name>token_pattern)-->
//!     measurement = "uv", tags = { node_name = "weather" }
//! ```

use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

/// Shorthand accepted in pattern sources.
pub const TOKEN_PLACEHOLDER: &str = "token_pattern";

/// Expansion of [`TOKEN_PLACEHOLDER`]: one or more word characters, dots or hyphens.
pub const TOKEN_EXPANSION: &str = r"(?:\w|-|\.)+";

/// Capture group that holds the measurement name unless configured otherwise.
pub const DEFAULT_MEASUREMENT_GROUP: &str = "measurement_name";

/// Errors raised while compiling a pattern. All of them are fatal at load time.
#[derive(Debug, Error)]
pub enum PatternError {
    /// The expression does not compile (this includes duplicate group names).
    #[error("pattern '{name}': invalid regex: {source}")]
    Regex {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("pattern '{0}' has no capture groups")]
    NoCaptureGroups(String),

    #[error("pattern '{name}' has no capture group named '{group}'")]
    MissingMeasurementGroup { name: String, group: String },
}

/// A compiled topic pattern.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    name: String,
    regex: Regex,
    measurement_group: String,
}

impl TopicPattern {
    /// Compile a pattern using the default `measurement_name` group.
    pub fn new(name: impl Into<String>, source: &str) -> Result<Self, PatternError> {
        Self::with_measurement_group(name, source, DEFAULT_MEASUREMENT_GROUP)
    }

    /// Compile a pattern whose measurement name lives in `measurement_group`.
    ///
    /// The placeholder `token_pattern` is expanded before compilation and the
    /// expression is anchored at both ends.
    pub fn with_measurement_group(
        name: impl Into<String>,
        source: &str,
        measurement_group: impl Into<String>,
    ) -> Result<Self, PatternError> {
        let name = name.into();
        let measurement_group = measurement_group.into();

        let expanded = expand_tokens(source);
        let regex = Regex::new(&format!("^(?:{})$", expanded)).map_err(|source| {
            PatternError::Regex {
                name: name.clone(),
                source,
            }
        })?;

        // captures_len() counts the implicit whole-match group
        if regex.captures_len() <= 1 {
            return Err(PatternError::NoCaptureGroups(name));
        }

        if !regex
            .capture_names()
            .flatten()
            .any(|g| g == measurement_group)
        {
            return Err(PatternError::MissingMeasurementGroup {
                name,
                group: measurement_group,
            });
        }

        Ok(Self {
            name,
            regex,
            measurement_group,
        })
    }

    /// Pattern name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the group holding the measurement name.
    pub fn measurement_group(&self) -> &str {
        &self.measurement_group
    }

    /// Anchored source of the compiled expression.
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Names of the groups that become tags.
    pub fn tag_keys(&self) -> impl Iterator<Item = &str> {
        self.regex
            .capture_names()
            .flatten()
            .filter(move |g| *g != self.measurement_group)
    }

    /// Match a topic against this pattern.
    pub fn match_topic(&self, topic: &str) -> Option<MatchResult> {
        let caps = self.regex.captures(topic)?;
        let measurement_name = caps.name(&self.measurement_group)?.as_str().to_string();

        let mut tags = BTreeMap::new();
        for key in self.tag_keys() {
            if let Some(m) = caps.name(key) {
                tags.insert(key.to_string(), m.as_str().to_string());
            }
        }

        Some(MatchResult {
            pattern_name: self.name.clone(),
            measurement_name,
            tags,
        })
    }
}

/// Identity extracted from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Name of the pattern that matched.
    pub pattern_name: String,
    /// Value of the measurement group.
    pub measurement_name: String,
    /// Every other named group, keyed by group name.
    pub tags: BTreeMap<String, String>,
}

/// Ordered, immutable set of topic patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternRegistry {
    patterns: Vec<TopicPattern>,
}

impl PatternRegistry {
    /// Create a registry from already compiled patterns, keeping their order.
    pub fn new(patterns: Vec<TopicPattern>) -> Self {
        Self { patterns }
    }

    /// Patterns in evaluation order.
    pub fn patterns(&self) -> &[TopicPattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Resolve a topic to the first matching pattern.
    pub fn match_topic(&self, topic: &str) -> Option<MatchResult> {
        for pattern in &self.patterns {
            if let Some(m) = pattern.match_topic(topic) {
                return Some(m);
            }
        }
        None
    }
}

/// Replace every `token_pattern` placeholder with its expansion.
pub fn expand_tokens(source: &str) -> String {
    source.replace(TOKEN_PLACEHOLDER, TOKEN_EXPANSION)
}
