// MQTT2Prom - Generic MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Per-message orchestration
//!
//! [`MessagePipeline`] drives one inbound `(topic, payload)` pair through
//! rename handling, ignore filtering, payload decoding, topic normalization,
//! flattening and registry updates. Every failure is local: a bad leaf skips
//! that leaf, a bad message drops that message, and nothing here ever blocks
//! or retries.

use std::collections::BTreeMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::error::{BridgeError, Result};
use crate::flatten::flatten;
use crate::naming::{clean_metric_path, sanitize_label_name, sanitize_metric_name};
use crate::normalize::{TopicNormalizer, AVAILABILITY_SUFFIX};
use crate::registry::{MetricRegistry, SeriesId};
use crate::value::{parse_scalar, StateValues};

/// Topic prefix of Zigbee2MQTT device messages
const ZIGBEE2MQTT_PREFIX: &str = "zigbee2mqtt/";

/// Topic suffix of Zigbee2MQTT rename notifications
const RENAME_SUFFIX: &str = "/rename";

/// Message pipeline: owns the normalizer, state table and metric registry
pub struct MessagePipeline {
    config: PipelineConfig,
    states: StateValues,
    normalizer: TopicNormalizer,
    registry: MetricRegistry,
    ignored: GlobSet,
    label_regex: Option<Regex>,
}

impl MessagePipeline {
    /// Build a pipeline from configuration
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] for unparseable ignore globs or
    /// label regex, and propagates receipt-counter registration failures.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.ignored_topics {
            if pattern.is_empty() {
                continue;
            }
            let glob = Glob::new(pattern).map_err(|e| {
                BridgeError::InvalidConfig(format!("bad ignore pattern '{pattern}': {e}"))
            })?;
            builder.add(glob);
        }
        let ignored = builder
            .build()
            .map_err(|e| BridgeError::InvalidConfig(e.to_string()))?;

        let label_regex = match &config.topic_label_regex {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                BridgeError::InvalidConfig(format!("bad topic label regex: {e}"))
            })?),
            None => None,
        };

        let states = StateValues::with_overrides(&config.state_value_overrides);
        let normalizer = TopicNormalizer::from_config(&config);
        let registry = MetricRegistry::new(&config)?;

        Ok(Self {
            config,
            states,
            normalizer,
            registry,
            ignored,
            label_regex,
        })
    }

    /// Process one inbound message
    ///
    /// `properties` carries protocol-level user property pairs (MQTT v5);
    /// pass an empty slice when the transport has none.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8], properties: &[(String, String)]) {
        if topic.starts_with(ZIGBEE2MQTT_PREFIX) && topic.ends_with(RENAME_SUFFIX) {
            self.handle_rename(payload);
            return;
        }

        if self.ignored.is_match(topic) {
            debug!(topic, "topic matches an ignore pattern");
            return;
        }

        let parsed = match self.decode_payload(payload) {
            Ok(value) => value,
            Err(e) => {
                debug!(topic, "dropping message: {e}");
                return;
            }
        };

        let (canonical_topic, payload_map) = self.normalizer.normalize(topic, parsed);
        if canonical_topic.is_empty() || payload_map.is_empty() {
            debug!(topic, "message did not normalize, dropping");
            return;
        }

        let extra_labels = self.extra_labels(topic, properties);
        let client_id = if self.config.expose_client_id {
            Some(self.config.client_id.as_str())
        } else {
            None
        };

        if self.config.parse_message_payload {
            let label_keys: Vec<String> = extra_labels.keys().cloned().collect();
            for (path, raw) in flatten(&payload_map) {
                let value = match parse_scalar(raw, &self.states) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(topic, leaf = %path, "skipping leaf: {e}");
                        continue;
                    }
                };

                let candidate =
                    format!("{}{}", self.config.metric_prefix, clean_metric_path(&path));
                let id = SeriesId::new(sanitize_metric_name(&candidate), label_keys.clone());

                match self.registry.get_or_create(&id, topic) {
                    Ok(()) => self.registry.record_sample(
                        &id,
                        &canonical_topic,
                        client_id,
                        &extra_labels,
                        value,
                        topic,
                    ),
                    Err(e @ BridgeError::CardinalityExceeded { .. }) => {
                        error!(series = %id, "{e}");
                    }
                    Err(e) => {
                        error!(series = %id, "unable to create series: {e}");
                    }
                }
            }
        }

        self.registry.inc_message_count(&canonical_topic, client_id);
    }

    /// Read access to the registry, for exposition
    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// The active configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle a Zigbee2MQTT rename notification
    ///
    /// Every labeled sample recorded under the old device topic (and its
    /// availability topic, when that convention is on) stops being exposed.
    fn handle_rename(&mut self, payload: &[u8]) {
        let parsed: Value = match std::str::from_utf8(payload)
            .ok()
            .and_then(|text| serde_json::from_str(text).ok())
        {
            Some(value) => value,
            None => {
                debug!("unparseable rename notification");
                return;
            }
        };

        let from = parsed
            .get("data")
            .and_then(|data| data.get("from"))
            .and_then(Value::as_str);
        let from = match from {
            Some(from) => from,
            None => {
                debug!("rename notification without data.from");
                return;
            }
        };

        let old_topic = format!("{ZIGBEE2MQTT_PREFIX}{from}");
        let removed = self.registry.evict_topic(&old_topic);
        info!(%old_topic, removed, "device renamed, evicted old series");

        if self.config.zigbee2mqtt_availability {
            self.registry
                .evict_topic(&format!("{old_topic}{AVAILABILITY_SUFFIX}"));
        }
    }

    /// Decode raw payload bytes into a JSON value
    ///
    /// A payload that is exactly a state token becomes its numeric value;
    /// everything else must parse as JSON.
    fn decode_payload(&self, payload: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| BridgeError::MalformedPayload("undecodable bytes".to_string()))?;

        if let Some(mapped) = self.states.get_exact(text) {
            return serde_json::Number::from_f64(mapped)
                .map(Value::Number)
                .ok_or_else(|| {
                    BridgeError::MalformedPayload(format!("non-finite state value for '{text}'"))
                });
        }

        serde_json::from_str(text)
            .map_err(|_| BridgeError::MalformedPayload(format!("not JSON: \"{text}\"")))
    }

    /// Labels shared by every metric derived from this message
    fn extra_labels(
        &self,
        topic: &str,
        properties: &[(String, String)],
    ) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        for (key, value) in properties {
            labels.insert(sanitize_label_name(key), value.clone());
        }

        if let Some(regex) = &self.label_regex {
            if let Some(caps) = regex.captures(topic) {
                for name in regex.capture_names().flatten() {
                    if let Some(matched) = caps.name(name) {
                        labels.insert(sanitize_label_name(name), matched.as_str().to_string());
                    }
                }
            }
        }

        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(config: PipelineConfig) -> MessagePipeline {
        MessagePipeline::new(config).unwrap()
    }

    fn sample_value(pipeline: &MessagePipeline, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        for family in pipeline.registry().gather() {
            if family.get_name() != name {
                continue;
            }
            for metric in family.get_metric() {
                let pairs: Vec<(&str, &str)> = metric
                    .get_label()
                    .iter()
                    .map(|l| (l.get_name(), l.get_value()))
                    .collect();
                if labels.iter().all(|pair| pairs.contains(pair)) {
                    return Some(metric.get_gauge().get_value());
                }
            }
        }
        None
    }

    #[test]
    fn test_ignored_topic_dropped() {
        let config = PipelineConfig {
            ignored_topics: vec!["test/ignored*".to_string()],
            ..Default::default()
        };
        let mut pipeline = pipeline(config);
        pipeline.handle_message("test/ignored/sensor", br#"{"temperature": 1.0}"#, &[]);
        assert_eq!(pipeline.registry().series_count(), 0);
        assert!(!pipeline.registry().encode_text().contains("message_total{"));
    }

    #[test]
    fn test_undecodable_payload_dropped() {
        let mut pipeline = pipeline(PipelineConfig::default());
        pipeline.handle_message("sensors/garage", &[0xff, 0xfe, 0x01], &[]);
        pipeline.handle_message("sensors/garage", b"not json at all", &[]);
        assert_eq!(pipeline.registry().series_count(), 0);
    }

    #[test]
    fn test_whole_payload_state_token() {
        let mut pipeline = pipeline(PipelineConfig::default());
        pipeline.handle_message("shellies/garage/relay/0", b"ON", &[]);
        assert_eq!(
            sample_value(&pipeline, "mqtt_0", &[("topic", "shellies_garage")]),
            Some(1.0)
        );
    }

    #[test]
    fn test_parse_payload_disabled_still_counts_messages() {
        let config = PipelineConfig {
            parse_message_payload: false,
            ..Default::default()
        };
        let mut pipeline = pipeline(config);
        pipeline.handle_message("sensors/garage", br#"{"temperature": 20.5}"#, &[]);
        assert_eq!(pipeline.registry().series_count(), 0);
        assert!(pipeline
            .registry()
            .encode_text()
            .contains("mqtt_message_total{topic=\"sensors_garage\"} 1"));
    }

    #[test]
    fn test_property_labels_on_series() {
        let mut pipeline = pipeline(PipelineConfig::default());
        let props = vec![("site".to_string(), "home".to_string())];
        pipeline.handle_message("sensors/garage", br#"{"temperature": 20.5}"#, &props);
        assert_eq!(
            sample_value(
                &pipeline,
                "mqtt_temperature",
                &[("topic", "sensors_garage"), ("site", "home")]
            ),
            Some(20.5)
        );
    }

    #[test]
    fn test_conflicting_label_key_set_skipped() {
        let mut pipeline = pipeline(PipelineConfig::default());
        let props = vec![("site".to_string(), "home".to_string())];
        pipeline.handle_message("sensors/garage", br#"{"temperature": 20.5}"#, &props);
        // same name with a different label-key set is a distinct identity;
        // the exposition sink refuses its registration, siblings unaffected
        pipeline.handle_message(
            "sensors/garage",
            br#"{"temperature": 21.0, "humidity": 40.0}"#,
            &[],
        );

        assert_eq!(pipeline.registry().series_count(), 2);
        assert_eq!(
            sample_value(
                &pipeline,
                "mqtt_temperature",
                &[("topic", "sensors_garage"), ("site", "home")]
            ),
            Some(20.5)
        );
        assert_eq!(
            sample_value(&pipeline, "mqtt_humidity", &[("topic", "sensors_garage")]),
            Some(40.0)
        );
    }

    #[test]
    fn test_topic_label_regex() {
        let config = PipelineConfig {
            topic_label_regex: Some(r"^(?P<vendor>[^/]+)/".to_string()),
            ..Default::default()
        };
        let mut pipeline = pipeline(config);
        pipeline.handle_message("sensors/garage", br#"{"temperature": 20.5}"#, &[]);
        assert_eq!(
            sample_value(
                &pipeline,
                "mqtt_temperature",
                &[("topic", "sensors_garage"), ("vendor", "sensors")]
            ),
            Some(20.5)
        );
    }

    #[test]
    fn test_bad_ignore_pattern_rejected() {
        let config = PipelineConfig {
            ignored_topics: vec!["bad[".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            MessagePipeline::new(config),
            Err(BridgeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_bad_label_regex_rejected() {
        let config = PipelineConfig {
            topic_label_regex: Some("(unclosed".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            MessagePipeline::new(config),
            Err(BridgeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_client_id_label() {
        let config = PipelineConfig {
            expose_client_id: true,
            client_id: "bridge-1".to_string(),
            ..Default::default()
        };
        let mut pipeline = pipeline(config);
        pipeline.handle_message("sensors/garage", br#"{"temperature": 20.5}"#, &[]);
        assert_eq!(
            sample_value(
                &pipeline,
                "mqtt_temperature",
                &[("topic", "sensors_garage"), ("client_id", "bridge-1")]
            ),
            Some(20.5)
        );
    }
}
