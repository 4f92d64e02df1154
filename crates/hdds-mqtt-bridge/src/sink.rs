// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Point sinks.
//!
//! A sink receives every translated point exactly once, stamps it with the
//! current time and stores it. [`InfluxSink`] batches Line Protocol and posts
//! it to the InfluxDB v2 write API; [`MemorySink`] and [`LogSink`] keep points
//! local for tests and dry runs.

use crate::buffer::BatchBuffer;
use crate::config::InfluxDbConfig;
use crate::point::Point;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Sink errors. Each variant carries the number of points it lost.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP error writing {points} points: {source}")]
    Http {
        points: usize,
        #[source]
        source: reqwest::Error,
    },

    #[error("InfluxDB rejected {points} points ({status}): {body}")]
    Status {
        points: usize,
        status: u16,
        body: String,
    },
}

impl SinkError {
    /// Points discarded because of this error.
    pub fn points(&self) -> usize {
        match self {
            SinkError::Http { points, .. } | SinkError::Status { points, .. } => *points,
        }
    }
}

/// Destination of translated points.
///
/// Both methods return how many points reached the store during the call.
/// A buffering sink returns 0 from `write` until a batch goes out.
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Accept one point, stamped at write time.
    async fn write(&self, point: &Point) -> Result<usize, SinkError>;

    /// Write out anything still buffered.
    async fn flush(&self) -> Result<usize, SinkError> {
        Ok(0)
    }
}

/// Current time in nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// InfluxDB v2 HTTP sink.
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
    buffer: Mutex<BatchBuffer>,
}

impl InfluxSink {
    pub fn new(config: &InfluxDbConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
            buffer: Mutex::new(BatchBuffer::new(
                config.batch_size,
                Duration::from_millis(config.flush_interval_ms),
            )),
        }
    }

    /// Write endpoint, without query string.
    pub fn write_url(&self) -> &str {
        &self.write_url
    }

    /// Lines waiting for the next write.
    pub fn pending(&self) -> usize {
        lock(&self.buffer).len()
    }

    async fn send(&self, lines: Vec<String>) -> Result<usize, SinkError> {
        if lines.is_empty() {
            return Ok(0);
        }
        let points = lines.len();

        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(lines.join("\n"))
            .send()
            .await
            .map_err(|source| SinkError::Http { points, source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                points,
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!("Wrote {} points to InfluxDB", points);
        Ok(points)
    }
}

#[async_trait]
impl PointSink for InfluxSink {
    async fn write(&self, point: &Point) -> Result<usize, SinkError> {
        let line = point.to_line_protocol(now_ns());
        tracing::debug!("Writing InfluxDB point: {}", line);

        let ready = lock(&self.buffer).push(line);
        match ready {
            Some(batch) => self.send(batch).await,
            None => Ok(0),
        }
    }

    async fn flush(&self) -> Result<usize, SinkError> {
        let batch = lock(&self.buffer).take();
        self.send(batch).await
    }
}

/// Collects points in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    points: Mutex<Vec<Point>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every point written so far.
    pub fn points(&self) -> Vec<Point> {
        lock(&self.points).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.points).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.points).is_empty()
    }
}

#[async_trait]
impl PointSink for MemorySink {
    async fn write(&self, point: &Point) -> Result<usize, SinkError> {
        lock(&self.points).push(point.clone());
        Ok(1)
    }
}

/// Logs each point as Line Protocol instead of storing it (dry run).
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl PointSink for LogSink {
    async fn write(&self, point: &Point) -> Result<usize, SinkError> {
        tracing::info!("{}", point.to_line_protocol(now_ns()));
        Ok(1)
    }
}
