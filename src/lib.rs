// MQTT2Prom - Generic MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # MQTT2Prom - Generic MQTT to Prometheus bridge
//!
//! Turns arbitrary IoT telemetry published over MQTT into uniquely
//! identified Prometheus series, without per-device configuration.
//!
//! ## Key Features
//!
//! - **Topic normalization**: vendor conventions (Zigbee2MQTT, Z-Wave,
//!   Shelly, ESPHome, Hubitat) collapse to one canonical shape
//! - **Recursive flattening**: nested JSON payloads become dotted-path series
//! - **Lazy registry**: series are created on first sample, bounded by a
//!   configurable budget
//! - **Rename eviction**: stale series disappear when a device is renamed
//!
//! ## Quick Start
//!
//! ```rust
//! use mqtt2prom::{MessagePipeline, PipelineConfig};
//!
//! let mut pipeline = MessagePipeline::new(PipelineConfig::default()).unwrap();
//!
//! // feed a raw MQTT message through the pipeline
//! pipeline.handle_message(
//!     "zigbee2mqtt/0x00157d00032b1234",
//!     br#"{"temperature":26.24,"humidity":45.37}"#,
//!     &[],
//! );
//!
//! // render the exposition snapshot
//! let text = pipeline.registry().encode_text();
//! assert!(text.contains("mqtt_temperature"));
//! assert!(text.contains("topic=\"zigbee2mqtt_0x00157d00032b1234\""));
//! ```
//!
//! ## Modules
//!
//! - [`value`]: leaf value parsing (numbers, state words, numeric strings)
//! - [`naming`]: series/label name sanitization
//! - [`flatten`]: recursive payload flattening
//! - [`normalize`]: vendor topic convention chain
//! - [`registry`]: dynamic series registry and rename eviction
//! - [`pipeline`]: per-message orchestration

// Modules
pub mod config;
pub mod error;
pub mod flatten;
pub mod naming;
pub mod normalize;
pub mod pipeline;
pub mod registry;
pub mod value;

// Re-exports for convenient access
pub use config::PipelineConfig;
pub use error::{BridgeError, Result};
pub use flatten::{flatten, FlattenedLeaves};
pub use naming::{clean_metric_path, sanitize_label_name, sanitize_metric_name};
pub use normalize::{TopicNormalizer, TopicScheme};
pub use pipeline::MessagePipeline;
pub use registry::{MetricRegistry, RegisteredSeries, SeriesId};
pub use value::{parse_scalar, StateValues};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
