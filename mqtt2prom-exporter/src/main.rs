// MQTT2Prom Exporter - Prometheus exporter for MQTT telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # MQTT2Prom Exporter
//!
//! Prometheus exporter turning MQTT telemetry into metrics, out of the box.
//!
//! ## Usage
//!
//! ```bash
//! # Connect to a local broker, expose metrics on :9000
//! mqtt2prom-exporter
//!
//! # Custom broker and port
//! mqtt2prom-exporter --mqtt-address broker.lan --port 9090
//! ```
//!
//! Every option also reads an environment variable (`MQTT_ADDRESS`,
//! `PROMETHEUS_PORT`, ...), so container deployments need no flags.

mod mqtt;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use clap::Parser;
use mqtt2prom::{MessagePipeline, PipelineConfig};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use mqtt::{MqttSettings, MqttStatus};

/// MQTT2Prom Prometheus Exporter
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the metrics server on
    #[arg(long, env = "PROMETHEUS_ADDRESS", default_value = "0.0.0.0")]
    listen_address: String,

    /// Port to listen on
    #[arg(short, long, env = "PROMETHEUS_PORT", default_value = "9000")]
    port: u16,

    /// MQTT broker address
    #[arg(long, env = "MQTT_ADDRESS", default_value = "127.0.0.1")]
    mqtt_address: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value = "1883")]
    mqtt_port: u16,

    /// Topic filter to subscribe to
    #[arg(long, env = "MQTT_TOPIC", default_value = "#")]
    mqtt_topic: String,

    /// MQTT username
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// MQTT client identifier
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "mqtt2prom")]
    mqtt_client_id: String,

    /// MQTT keepalive in seconds
    #[arg(long, env = "MQTT_KEEPALIVE", default_value = "60")]
    mqtt_keepalive: u64,

    /// CA certificate file; enables TLS towards the broker
    #[arg(long, env = "MQTT_TLS_CA")]
    mqtt_tls_ca: Option<String>,

    /// Prefix prepended to every series name
    #[arg(long, env = "PROMETHEUS_PREFIX", default_value = "mqtt_")]
    prefix: String,

    /// Label carrying the canonical topic
    #[arg(long, env = "TOPIC_LABEL", default_value = "topic")]
    topic_label: String,

    /// Comma-separated topic globs to drop without processing
    #[arg(long, env = "MQTT_IGNORED_TOPICS", value_delimiter = ',')]
    ignored_topics: Vec<String>,

    /// Topic prefix of the Z-Wave-to-MQTT convention
    #[arg(long, env = "ZWAVE_TOPIC_PREFIX", default_value = "zwave/")]
    zwave_topic_prefix: String,

    /// Comma-separated ESPHome topic prefixes
    #[arg(long, env = "ESPHOME_TOPIC_PREFIXES", value_delimiter = ',')]
    esphome_topic_prefixes: Vec<String>,

    /// Comma-separated Hubitat topic prefixes
    #[arg(
        long,
        env = "HUBITAT_TOPIC_PREFIXES",
        value_delimiter = ',',
        default_value = "hubitat/"
    )]
    hubitat_topic_prefixes: Vec<String>,

    /// Keep all topic segments but the metric name in the canonical topic
    #[arg(long, env = "KEEP_FULL_TOPIC")]
    keep_full_topic: bool,

    /// Parse message payloads into metrics
    #[arg(
        long,
        env = "PARSE_MSG_PAYLOAD",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    parse_msg_payload: bool,

    /// Recognize the Zigbee2MQTT availability suffix
    #[arg(long, env = "ZIGBEE2MQTT_AVAILABILITY")]
    zigbee2mqtt_availability: bool,

    /// Expose a <name>_ts last-seen shadow series per metric
    #[arg(long, env = "EXPOSE_LAST_SEEN")]
    expose_last_seen: bool,

    /// Add a client_id label to every series
    #[arg(long, env = "MQTT_EXPOSE_CLIENT_ID")]
    expose_client_id: bool,

    /// Maximum number of series, 0 = unlimited
    #[arg(long, env = "MAX_METRICS", default_value = "0")]
    max_metrics: usize,

    /// Extra state tokens as NAME=VALUE pairs, comma separated
    #[arg(long, env = "STATE_VALUES", value_delimiter = ',')]
    state_values: Vec<String>,

    /// Regex with named capture groups extracting labels from the raw topic
    #[arg(long, env = "TOPIC_LABEL_REGEX")]
    topic_label_regex: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Application state shared across handlers.
struct AppState {
    pipeline: Arc<RwLock<MessagePipeline>>,
    mqtt_status: Arc<MqttStatus>,
    start_time: Instant,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("MQTT2Prom Exporter v{}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig {
        metric_prefix: args.prefix.clone(),
        topic_label: args.topic_label.clone(),
        ignored_topics: args.ignored_topics.clone(),
        zwave_topic_prefix: args.zwave_topic_prefix.clone(),
        esphome_topic_prefixes: args.esphome_topic_prefixes.clone(),
        hubitat_topic_prefixes: args.hubitat_topic_prefixes.clone(),
        keep_full_topic: args.keep_full_topic,
        parse_message_payload: args.parse_msg_payload,
        zigbee2mqtt_availability: args.zigbee2mqtt_availability,
        expose_last_seen: args.expose_last_seen,
        expose_client_id: args.expose_client_id,
        client_id: args.mqtt_client_id.clone(),
        max_metrics: args.max_metrics,
        state_value_overrides: parse_state_values(&args.state_values),
        topic_label_regex: args.topic_label_regex.clone(),
    };

    let pipeline = match MessagePipeline::new(config) {
        Ok(pipeline) => Arc::new(RwLock::new(pipeline)),
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    // Start the MQTT ingest loop in the background
    let mqtt_settings = MqttSettings {
        host: args.mqtt_address.clone(),
        port: args.mqtt_port,
        client_id: args.mqtt_client_id.clone(),
        username: args.mqtt_username.clone(),
        password: args.mqtt_password.clone(),
        keepalive_secs: args.mqtt_keepalive,
        subscribe_topic: args.mqtt_topic.clone(),
        tls_ca_path: args.mqtt_tls_ca.clone(),
    };
    let mqtt_status = Arc::new(MqttStatus::new(format!(
        "{}:{}",
        args.mqtt_address, args.mqtt_port
    )));
    tokio::spawn(mqtt::run(
        mqtt_settings,
        pipeline.clone(),
        mqtt_status.clone(),
    ));

    // Create app state
    let state = Arc::new(AppState {
        pipeline,
        mqtt_status,
        start_time: Instant::now(),
    });

    // Build router
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    // Start server
    let addr = format!("{}:{}", args.listen_address, args.port);
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

/// Parse NAME=VALUE state token overrides; bad entries are skipped.
fn parse_state_values(entries: &[String]) -> Vec<(String, f64)> {
    let mut overrides = Vec::new();
    for entry in entries {
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some((name, value)) => match value.trim().parse::<f64>() {
                Ok(value) => overrides.push((name.trim().to_string(), value)),
                Err(_) => warn!("ignoring state value with non-numeric value: '{entry}'"),
            },
            None => warn!("ignoring malformed state value entry: '{entry}'"),
        }
    }
    overrides
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>MQTT2Prom Exporter</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        a { color: #3498db; text-decoration: none; }
        a:hover { text-decoration: underline; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { margin: 10px 0; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>MQTT2Prom Exporter</h1>
    <p>Prometheus exporter turning MQTT telemetry into metrics.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div class="endpoint"><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div class="endpoint"><a href="/health">/health</a> - Health check</div>
        <div class="endpoint"><a href="/ready">/ready</a> - Readiness check (broker connected)</div>
        <div class="endpoint"><a href="/status">/status</a> - Status information (JSON)</div>
    </div>

    <h2>Metrics</h2>
    <ul>
        <li><code>mqtt_&lt;name&gt;</code> - Gauges flattened from message payloads</li>
        <li><code>mqtt_&lt;name&gt;_ts</code> - Last-seen timestamps (optional)</li>
        <li><code>mqtt_message_total</code> - Received message counter per topic</li>
    </ul>
</body>
</html>"#,
    )
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = state.pipeline.read().await.registry().encode_text();
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler - ready once the broker connection is up.
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.mqtt_status.is_connected() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Waiting for MQTT broker")
    }
}

/// Status information response.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    broker: String,
    connected: bool,
    series: usize,
    tracked_topics: usize,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let (series, tracked_topics) = {
        let pipeline = state.pipeline.read().await;
        (
            pipeline.registry().series_count(),
            pipeline.registry().tracked_topics(),
        )
    };

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        broker: state.mqtt_status.broker().to_string(),
        connected: state.mqtt_status.is_connected(),
        series,
        tracked_topics,
    })
}
