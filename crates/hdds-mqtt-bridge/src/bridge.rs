// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT bridge runtime.
//!
//! Subscribes to the configured topic filters, translates each publish and
//! hands the resulting point to a [`PointSink`].

use crate::config::{BridgeConfig, ConfigError, MqttConfig};
use crate::pipeline::Translator;
use crate::point::Point;
use crate::sink::{PointSink, SinkError};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Consecutive event loop errors tolerated before the bridge stops.
const MAX_POLL_ERRORS: u32 = 5;

/// Back-off between failed polls.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Bridge already running")]
    AlreadyRunning,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted by the sink. A buffering sink may store it later.
    Written,
    /// No pattern matched the topic.
    Dropped,
    /// Same fields as the previous point of the series.
    Unchanged,
    /// Translated, but the sink failed.
    Failed,
}

/// Bridge counters.
#[derive(Debug)]
pub struct BridgeStats {
    /// Publishes received from the broker.
    pub received: AtomicU64,

    /// Messages that matched a pattern.
    pub translated: AtomicU64,

    /// Messages dropped (no pattern matched).
    pub dropped: AtomicU64,

    /// Points skipped as repeats of the previous point.
    pub unchanged: AtomicU64,

    /// Points confirmed stored by the sink.
    pub written: AtomicU64,

    /// Points lost to sink errors.
    pub errors: AtomicU64,

    /// Bridge creation time.
    pub created: Instant,
}

impl BridgeStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            translated: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            written: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Get a snapshot of current stats.
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            translated: self.translated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Default)]
pub struct BridgeStatsSnapshot {
    /// Publishes received from the broker.
    pub received: u64,
    /// Messages that matched a pattern.
    pub translated: u64,
    /// Messages dropped (no pattern matched).
    pub dropped: u64,
    /// Points skipped as repeats.
    pub unchanged: u64,
    /// Points confirmed stored.
    pub written: u64,
    /// Points lost to sink errors.
    pub errors: u64,
    /// Seconds since the bridge was created.
    pub uptime_secs: u64,
}

impl BridgeStatsSnapshot {
    /// Received messages per second since start.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.received as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

type SeriesKey = (String, BTreeMap<String, String>);

/// Handle to stop a running bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    running: Arc<AtomicBool>,
    stats: Arc<BridgeStats>,
}

impl BridgeHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Request the event loop to stop after the current poll.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.stats.snapshot()
    }
}

/// MQTT-to-sink bridge.
pub struct Bridge {
    translator: Arc<Translator>,
    sink: Arc<dyn PointSink>,
    subscriptions: Vec<String>,
    skip_unchanged: bool,
    last_fields: Mutex<HashMap<SeriesKey, Point>>,
    stats: Arc<BridgeStats>,
    running: Arc<AtomicBool>,
}

impl Bridge {
    /// Build a bridge from configuration. Pattern errors surface here.
    pub fn new(config: &BridgeConfig, sink: Arc<dyn PointSink>) -> Result<Self, BridgeError> {
        config.validate()?;
        let translator = config.build_translator()?;

        Ok(Self {
            translator: Arc::new(translator),
            sink,
            subscriptions: config.subscriptions(),
            skip_unchanged: config.skip_unchanged,
            last_fields: Mutex::new(HashMap::new()),
            stats: Arc::new(BridgeStats::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    /// MQTT filters the bridge subscribes to.
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            running: self.running.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Translate one message and write the point.
    ///
    /// Never fails: unmatched topics are dropped and sink errors are logged
    /// and counted.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Outcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Received MQTT message for topic {} with payload {}",
            topic,
            String::from_utf8_lossy(payload)
        );

        let point = match self.translator.translate(topic, payload) {
            Some(p) => p,
            None => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("No pattern matches topic {}, dropping message", topic);
                return Outcome::Dropped;
            }
        };
        self.stats.translated.fetch_add(1, Ordering::Relaxed);

        if self.skip_unchanged && self.is_unchanged(&point) {
            self.stats.unchanged.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Value did not change for {}, skipping", point.measurement);
            return Outcome::Unchanged;
        }

        match self.sink.write(&point).await {
            Ok(stored) => {
                self.stats.written.fetch_add(stored as u64, Ordering::Relaxed);
                if self.skip_unchanged {
                    self.remember(point);
                }
                Outcome::Written
            }
            Err(e) => {
                tracing::error!("Failed to write point for {}: {}", point.measurement, e);
                self.record_failure(&e);
                Outcome::Failed
            }
        }
    }

    /// Write out buffered points, counting what was stored or lost.
    pub async fn flush(&self) {
        match self.sink.flush().await {
            Ok(stored) => {
                self.stats.written.fetch_add(stored as u64, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("Flush failed: {}", e);
                self.record_failure(&e);
            }
        }
    }

    fn last_fields(&self) -> MutexGuard<'_, HashMap<SeriesKey, Point>> {
        self.last_fields
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True if `point` repeats the last point accepted for its series.
    fn is_unchanged(&self, point: &Point) -> bool {
        self.last_fields()
            .get(&point.series_key())
            .is_some_and(|previous| previous.fields == point.fields)
    }

    fn remember(&self, point: Point) {
        self.last_fields().insert(point.series_key(), point);
    }

    /// Count lost points. Remembered values may belong to the lost batch,
    /// so the next value of every series is written again.
    fn record_failure(&self, err: &SinkError) {
        self.stats
            .errors
            .fetch_add(err.points() as u64, Ordering::Relaxed);
        self.last_fields().clear();
    }

    /// Connect to the broker and process messages until stopped.
    ///
    /// Subscriptions are (re)issued on every `ConnAck`, so they survive
    /// reconnects performed by the event loop. Buffered points are flushed
    /// every `flush_interval` and once more on exit, whatever ends the loop.
    pub async fn run(&self, mqtt: &MqttConfig, flush_interval: Duration) -> Result<(), BridgeError> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Err(BridgeError::AlreadyRunning);
        }

        let (client, eventloop) = connect(mqtt);
        tracing::info!(
            "Connecting to MQTT broker {}:{} as {}",
            mqtt.host,
            mqtt.port,
            mqtt.client_id
        );

        let result = self.process(&client, eventloop, flush_interval).await;

        self.running.store(false, Ordering::Relaxed);
        self.flush().await;
        tracing::info!("MQTT bridge stopped");
        result
    }

    async fn process(
        &self,
        client: &AsyncClient,
        mut eventloop: EventLoop,
        flush_interval: Duration,
    ) -> Result<(), BridgeError> {
        let mut flush_tick = tokio::time::interval(flush_interval.max(Duration::from_millis(10)));
        let mut error_count = 0;

        while self.running.load(Ordering::Relaxed) {
            tokio::select! {
                _ = flush_tick.tick() => self.flush().await,
                notification = eventloop.poll() => match notification {
                    Ok(event) => {
                        error_count = 0;
                        self.on_event(client, event).await?;
                    }
                    Err(e) => {
                        error_count += 1;
                        if error_count >= MAX_POLL_ERRORS {
                            tracing::error!(
                                "MQTT error count reached {}, stopping: {}",
                                MAX_POLL_ERRORS,
                                e
                            );
                            break;
                        }
                        tracing::warn!("MQTT error ({}/{}): {}", error_count, MAX_POLL_ERRORS, e);
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                    }
                },
            }
        }
        Ok(())
    }

    async fn on_event(&self, client: &AsyncClient, event: Event) -> Result<(), BridgeError> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                tracing::info!("Connected with result code {:?}", ack.code);
                for filter in &self.subscriptions {
                    tracing::info!("Subscribing to topic {}", filter);
                }
                // One request: the client channel is drained by the task running this
                let filters = self
                    .subscriptions
                    .iter()
                    .map(|f| SubscribeFilter::new(f.clone(), QoS::AtLeastOnce));
                client.subscribe_many(filters).await?;
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.handle_message(&publish.topic, &publish.payload).await;
            }
            _ => {}
        }
        Ok(())
    }
}

fn connect(mqtt: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(&mqtt.client_id, &mqtt.host, mqtt.port);
    options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs.max(5)));
    if let (Some(user), Some(pass)) = (&mqtt.username, &mqtt.password) {
        options.set_credentials(user, pass);
    }
    AsyncClient::new(options, 64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternConfig;
    use crate::influx::FieldValue;
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use rumqttc::{ConnAck, ConnectReturnCode};
    use std::sync::atomic::AtomicUsize;

    fn unavailable(points: usize) -> SinkError {
        SinkError::Status {
            points,
            status: 503,
            body: "unavailable".into(),
        }
    }

    struct FailingSink;

    #[async_trait]
    impl PointSink for FailingSink {
        async fn write(&self, _point: &Point) -> Result<usize, SinkError> {
            Err(unavailable(1))
        }
    }

    /// Fails the first `failures` writes, then stores everything.
    struct FlakySink {
        failures: AtomicUsize,
        inner: MemorySink,
    }

    impl FlakySink {
        fn new(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                inner: MemorySink::new(),
            }
        }
    }

    #[async_trait]
    impl PointSink for FlakySink {
        async fn write(&self, point: &Point) -> Result<usize, SinkError> {
            let left = self.failures.load(Ordering::Relaxed);
            if left > 0 {
                self.failures.store(left - 1, Ordering::Relaxed);
                return Err(unavailable(1));
            }
            self.inner.write(point).await
        }
    }

    /// Buffers points and sends them in batches of `batch`, optionally failing.
    struct BatchSink {
        batch: usize,
        fail: bool,
        buffered: Mutex<usize>,
        flushes: AtomicUsize,
    }

    impl BatchSink {
        fn new(batch: usize, fail: bool) -> Self {
            Self {
                batch,
                fail,
                buffered: Mutex::new(0),
                flushes: AtomicUsize::new(0),
            }
        }

        fn send(&self, points: usize) -> Result<usize, SinkError> {
            if self.fail && points > 0 {
                Err(unavailable(points))
            } else {
                Ok(points)
            }
        }
    }

    #[async_trait]
    impl PointSink for BatchSink {
        async fn write(&self, _point: &Point) -> Result<usize, SinkError> {
            let ready = {
                let mut buffered = self.buffered.lock().expect("lock");
                *buffered += 1;
                if *buffered < self.batch {
                    return Ok(0);
                }
                std::mem::take(&mut *buffered)
            };
            self.send(ready)
        }

        async fn flush(&self) -> Result<usize, SinkError> {
            self.flushes.fetch_add(1, Ordering::Relaxed);
            let ready = std::mem::take(&mut *self.buffered.lock().expect("lock"));
            self.send(ready)
        }
    }

    fn conn_ack() -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }))
    }

    fn unreachable_broker() -> MqttConfig {
        let mut mqtt = BridgeConfig::example().mqtt;
        mqtt.host = "127.0.0.1".into();
        mqtt.port = 1;
        mqtt
    }

    fn bridge_with(config: &BridgeConfig) -> (Bridge, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let bridge = Bridge::new(config, sink.clone()).expect("bridge");
        (bridge, sink)
    }

    #[tokio::test]
    async fn test_handle_message_writes_point() {
        let (bridge, sink) = bridge_with(&BridgeConfig::example());

        let outcome = bridge.handle_message("weather/uv", b"0").await;
        assert_eq!(outcome, Outcome::Written);

        let points = sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "uv");
        assert_eq!(points[0].fields["value"], FieldValue::Float(0.0));

        let stats = bridge.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.translated, 1);
        assert_eq!(stats.written, 1);
    }

    #[tokio::test]
    async fn test_unmatched_topic_never_reaches_sink() {
        let (bridge, sink) = bridge_with(&BridgeConfig::example());

        let outcome = bridge.handle_message("garage/door", b"open").await;
        assert_eq!(outcome, Outcome::Dropped);
        assert!(sink.is_empty());
        assert_eq!(bridge.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_skip_unchanged_per_series() {
        let mut config = BridgeConfig::example();
        config.skip_unchanged = true;
        let (bridge, sink) = bridge_with(&config);

        assert_eq!(bridge.handle_message("weather/uv", b"1").await, Outcome::Written);
        assert_eq!(bridge.handle_message("weather/uv", b"1").await, Outcome::Unchanged);
        assert_eq!(bridge.handle_message("weather/uv", b"2").await, Outcome::Written);
        // different series with the same value
        assert_eq!(
            bridge.handle_message("sensors/kitchen/uv/state", b"2").await,
            Outcome::Written
        );

        assert_eq!(sink.len(), 3);
        assert_eq!(bridge.stats().unchanged, 1);
    }

    #[tokio::test]
    async fn test_repeats_written_when_skip_disabled() {
        let (bridge, sink) = bridge_with(&BridgeConfig::example());

        bridge.handle_message("weather/uv", b"1").await;
        bridge.handle_message("weather/uv", b"1").await;
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_sink_failure_is_counted() {
        let bridge = Bridge::new(&BridgeConfig::example(), Arc::new(FailingSink)).expect("bridge");

        assert_eq!(bridge.handle_message("weather/uv", b"1").await, Outcome::Failed);
        let stats = bridge.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.written, 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_remembered() {
        let mut config = BridgeConfig::example();
        config.skip_unchanged = true;
        let sink = Arc::new(FlakySink::new(1));
        let bridge = Bridge::new(&config, sink.clone()).expect("bridge");

        assert_eq!(bridge.handle_message("weather/uv", b"1").await, Outcome::Failed);
        assert_eq!(bridge.handle_message("weather/uv", b"1").await, Outcome::Written);
        assert_eq!(bridge.handle_message("weather/uv", b"1").await, Outcome::Unchanged);
        assert_eq!(sink.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_counts_every_lost_point() {
        let mut config = BridgeConfig::example();
        config.skip_unchanged = true;
        let bridge = Bridge::new(&config, Arc::new(BatchSink::new(3, true))).expect("bridge");

        assert_eq!(bridge.handle_message("weather/uv", b"1").await, Outcome::Written);
        assert_eq!(bridge.handle_message("weather/uv", b"2").await, Outcome::Written);
        assert_eq!(bridge.stats().written, 0);
        assert_eq!(bridge.handle_message("weather/uv", b"3").await, Outcome::Failed);

        let stats = bridge.stats();
        assert_eq!(stats.written, 0);
        assert_eq!(stats.errors, 3);

        // "2" was lost with the batch, so it is not a repeat
        assert_eq!(bridge.handle_message("weather/uv", b"2").await, Outcome::Written);
        bridge.flush().await;
        assert_eq!(bridge.stats().errors, 4);
    }

    #[tokio::test]
    async fn test_written_counts_stored_points() {
        let bridge =
            Bridge::new(&BridgeConfig::example(), Arc::new(BatchSink::new(2, false))).expect("bridge");

        for value in [b"1", b"2", b"3"] {
            bridge.handle_message("weather/uv", value).await;
        }
        assert_eq!(bridge.stats().written, 2);

        bridge.flush().await;
        let stats = bridge.stats();
        assert_eq!(stats.written, 3);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_conn_ack_subscribes_beyond_channel_capacity() {
        let mut config = BridgeConfig::example();
        config.patterns = (0..70)
            .map(|i| {
                PatternConfig::new(
                    format!("node{}", i),
                    format!("(?P<node_name>node{})/(?P<measurement_name>token_pattern)", i),
                )
            })
            .collect();
        let (bridge, _) = bridge_with(&config);
        assert_eq!(bridge.subscriptions().len(), 70);

        let (client, _eventloop) = connect(&unreachable_broker());
        let result =
            tokio::time::timeout(Duration::from_secs(3), bridge.on_event(&client, conn_ack())).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_subscribe_error_is_reported() {
        let (bridge, _) = bridge_with(&BridgeConfig::example());
        let (client, eventloop) = connect(&unreachable_broker());
        drop(eventloop);

        let result = bridge.on_event(&client, conn_ack()).await;
        assert!(matches!(result, Err(BridgeError::Mqtt(_))));
    }

    #[tokio::test]
    async fn test_run_always_shuts_down_cleanly() {
        let sink = Arc::new(BatchSink::new(100, false));
        let bridge = Bridge::new(&BridgeConfig::example(), sink.clone()).expect("bridge");
        bridge.handle_message("weather/uv", b"1").await;

        // Gives up after the poll error budget; no broker listens on port 1
        bridge
            .run(&unreachable_broker(), Duration::from_secs(3600))
            .await
            .expect("run");

        assert!(!bridge.handle().is_running());
        assert_eq!(bridge.stats().written, 1);
        assert!(sink.flushes.load(Ordering::Relaxed) >= 1);
        assert!(!matches!(
            bridge.run(&unreachable_broker(), Duration::from_secs(3600)).await,
            Err(BridgeError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_bridge_rejects_bad_pattern() {
        let mut config = BridgeConfig::example();
        config.patterns = vec![PatternConfig::new("bare", "weather/uv")];

        let result = Bridge::new(&config, Arc::new(MemorySink::new()));
        assert!(matches!(result, Err(BridgeError::Config(ConfigError::Pattern(_)))));
    }

    #[test]
    fn test_handle_stop() {
        let (bridge, _) = bridge_with(&BridgeConfig::example());
        let handle = bridge.handle();

        assert!(!handle.is_running());
        bridge.running.store(true, Ordering::Relaxed);
        assert!(handle.is_running());
        handle.stop();
        assert!(!bridge.running.load(Ordering::Relaxed));
    }

    #[test]
    fn test_stats_rate() {
        let snapshot = BridgeStatsSnapshot {
            received: 100,
            uptime_secs: 10,
            ..Default::default()
        };
        assert!((snapshot.messages_per_second() - 10.0).abs() < f64::EPSILON);
        assert_eq!(BridgeStatsSnapshot::default().messages_per_second(), 0.0);
    }
}
