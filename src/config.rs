// MQTT2Prom - Generic MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for the message pipeline

/// Pipeline-level configuration
///
/// Defaults match the behavior of a plain out-of-the-box deployment:
/// `mqtt_`-prefixed gauges labeled by `topic`, Z-Wave and Hubitat topic
/// conventions recognized, everything else optional and off.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Prefix prepended to every series name (default: "mqtt_")
    pub metric_prefix: String,

    /// Label carrying the canonical topic on every series (default: "topic")
    pub topic_label: String,

    /// Glob patterns for topics to drop without processing
    pub ignored_topics: Vec<String>,

    /// Topic prefix identifying the Z-Wave-to-MQTT convention (default: "zwave/")
    pub zwave_topic_prefix: String,

    /// Topic prefixes identifying the ESPHome convention
    pub esphome_topic_prefixes: Vec<String>,

    /// Topic prefixes identifying the Hubitat convention (default: ["hubitat/"])
    pub hubitat_topic_prefixes: Vec<String>,

    /// Keep all topic segments but the last when the metric name is in the topic,
    /// instead of truncating to the first two segments
    pub keep_full_topic: bool,

    /// Parse message payloads into metrics; when off only the receipt counter moves
    pub parse_message_payload: bool,

    /// Recognize the Zigbee2MQTT `/availability` suffix and expose it as a
    /// `zigbee_availability` series on the device topic
    pub zigbee2mqtt_availability: bool,

    /// Maintain a `<name>_ts` shadow series holding the last-update Unix timestamp
    pub expose_last_seen: bool,

    /// Add a `client_id` label to every series and the receipt counter
    pub expose_client_id: bool,

    /// Client identifier used when `expose_client_id` is on
    pub client_id: String,

    /// Maximum number of registered series, shadows included (0 = unlimited)
    pub max_metrics: usize,

    /// Extra state tokens mapped to numeric values; override the built-in table
    pub state_value_overrides: Vec<(String, f64)>,

    /// Regular expression matched against the raw topic; named capture groups
    /// become additional labels on every series derived from the message
    pub topic_label_regex: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            metric_prefix: "mqtt_".to_string(),
            topic_label: "topic".to_string(),
            ignored_topics: Vec::new(),
            zwave_topic_prefix: "zwave/".to_string(),
            esphome_topic_prefixes: Vec::new(),
            hubitat_topic_prefixes: vec!["hubitat/".to_string()],
            keep_full_topic: false,
            parse_message_payload: true,
            zigbee2mqtt_availability: false,
            expose_last_seen: false,
            expose_client_id: false,
            client_id: String::new(),
            max_metrics: 0,
            state_value_overrides: Vec::new(),
            topic_label_regex: None,
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with a custom series name prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            metric_prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Create a configuration with a metric budget
    pub fn with_max_metrics(max_metrics: usize) -> Self {
        Self {
            max_metrics,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.metric_prefix, "mqtt_");
        assert_eq!(config.topic_label, "topic");
        assert_eq!(config.zwave_topic_prefix, "zwave/");
        assert_eq!(config.hubitat_topic_prefixes, vec!["hubitat/".to_string()]);
        assert!(config.parse_message_payload);
        assert!(!config.keep_full_topic);
        assert_eq!(config.max_metrics, 0);
    }

    #[test]
    fn test_pipeline_config_with_prefix() {
        let config = PipelineConfig::with_prefix("iot_");
        assert_eq!(config.metric_prefix, "iot_");
    }

    #[test]
    fn test_pipeline_config_with_max_metrics() {
        let config = PipelineConfig::with_max_metrics(100);
        assert_eq!(config.max_metrics, 100);
    }
}
