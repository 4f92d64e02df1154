// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS MQTT Bridge CLI
//!
//! Forwards MQTT sensor messages to InfluxDB.
//!
//! # Usage
//!
//! ```bash
//! # Run the bridge
//! hdds-mqtt-bridge --config bridge.yaml
//!
//! # Log points instead of writing them
//! hdds-mqtt-bridge --config bridge.yaml --dry-run
//!
//! # Check how a single message would be translated
//! hdds-mqtt-bridge translate --config bridge.yaml --topic weather/uv --payload 0
//! ```

use clap::{Parser, Subcommand};
use hdds_mqtt_bridge::sink::now_ns;
use hdds_mqtt_bridge::{
    Bridge, BridgeConfig, BridgeStatsSnapshot, InfluxSink, LogSink, PointSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// HDDS MQTT Bridge
#[derive(Parser, Debug)]
#[command(name = "hdds-mqtt-bridge")]
#[command(about = "HDDS MQTT Bridge - forward MQTT sensor messages to InfluxDB")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log points as Line Protocol instead of writing to InfluxDB
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error); overrides `verbose`
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "bridge.yaml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Translate one message and print the resulting Line Protocol
    Translate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// MQTT topic
        #[arg(short, long)]
        topic: String,

        /// Message payload
        #[arg(short, long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(cmd) = args.command {
        init_logging(args.log_level.as_deref(), false);
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
            Commands::Translate {
                config,
                topic,
                payload,
            } => cmd_translate(config, &topic, &payload),
        };
    }

    let config_path = args
        .config
        .ok_or("Missing --config (or use gen-config to create one)")?;
    let config = BridgeConfig::from_file(&config_path)?;
    init_logging(args.log_level.as_deref(), config.verbose);

    let sink: Arc<dyn PointSink> = if args.dry_run {
        Arc::new(LogSink)
    } else {
        Arc::new(InfluxSink::new(&config.influxdb))
    };
    let bridge = Arc::new(Bridge::new(&config, sink)?);

    println!("HDDS MQTT Bridge v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    println!("Broker: {}:{}", config.mqtt.host, config.mqtt.port);
    if args.dry_run {
        println!("InfluxDB: dry run (points are logged)");
    } else {
        println!(
            "InfluxDB: {} (bucket {})",
            config.influxdb.url, config.influxdb.bucket
        );
    }
    for pattern in bridge.translator().registry().patterns() {
        println!("Pattern: {} -> {}", pattern.name(), pattern.as_str());
    }
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    let handle = bridge.handle();

    if config.stats_interval_secs > 0 {
        let stats_handle = handle.clone();
        let stats_interval = config.stats_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                if !stats_handle.is_running() {
                    break;
                }
                print_stats(&stats_handle.stats());
            }
        });
    }

    let flush_interval = Duration::from_millis(config.influxdb.flush_interval_ms);
    let mqtt = config.mqtt.clone();
    let runner_bridge = bridge.clone();
    let mut runner =
        tokio::spawn(async move { runner_bridge.run(&mqtt, flush_interval).await });

    tokio::select! {
        result = &mut runner => {
            result??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("\nShutting down...");
            handle.stop();
            runner.await??;
        }
    }

    println!("\nFinal Statistics:");
    print_stats(&handle.stats());

    Ok(())
}

fn init_logging(level: Option<&str>, verbose: bool) {
    let level = level.unwrap_or(if verbose { "debug" } else { "info" });
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let yaml = serde_yaml::to_string(&BridgeConfig::example())?;

    let content = format!(
        r#"# HDDS MQTT Bridge Configuration
# Generated by hdds-mqtt-bridge gen-config
#
# Patterns are tried in order; the first full match wins.
# `token_pattern` expands to one or more word characters, dots or hyphens.

{}"#,
        yaml
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match BridgeConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Broker: {}:{}", config.mqtt.host, config.mqtt.port);
            println!("Patterns: {}", config.patterns.len());
            for (i, pattern) in config.patterns.iter().enumerate() {
                println!(
                    "  [{}] {} (subscribe {})",
                    i,
                    pattern.name,
                    pattern.subscription()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_translate(
    config_path: PathBuf,
    topic: &str,
    payload: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = BridgeConfig::from_file(&config_path)?;
    let translator = config.build_translator()?;

    match translator.registry().match_topic(topic) {
        Some(m) => println!("Matched pattern: {}", m.pattern_name),
        None => {
            println!("Dropped: no pattern matches topic {}", topic);
            return Ok(());
        }
    }

    if let Some(point) = translator.translate(topic, payload.as_bytes()) {
        println!("{}", point.to_line_protocol(now_ns()));
    }
    Ok(())
}

fn print_stats(stats: &BridgeStatsSnapshot) {
    println!(
        "--- Bridge Statistics ---\n  {} received ({:.1} msg/s), {} written, {} dropped, {} unchanged, {} errors",
        stats.received,
        stats.messages_per_second(),
        stats.written,
        stats.dropped,
        stats.unchanged,
        stats.errors
    );
}
