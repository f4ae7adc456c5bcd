// MQTT2Prom - Generic MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Topic normalization
//!
//! Heterogeneous MQTT integrations disagree on where the metric name lives:
//! some publish a JSON mapping on a device topic, some publish a bare value
//! on a per-metric topic, some spread the name across topic segments. The
//! [`TopicNormalizer`] rewrites every `(raw topic, raw payload)` pair into a
//! `(canonical topic, mapping payload)` pair so the rest of the pipeline only
//! ever sees one shape.
//!
//! Vendor conventions are modeled as an ordered chain of [`TopicScheme`]
//! strategies; the first scheme whose predicate matches performs the rewrite.
//! A message no scheme can interpret keeps its topic and payload when the
//! payload is already a mapping, and fails closed (empty payload) otherwise.

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::PipelineConfig;

/// Topic suffix appended by Zigbee2MQTT availability reporting
pub(crate) const AVAILABILITY_SUFFIX: &str = "/availability";

/// Synthetic key holding the availability state after the suffix rewrite
const AVAILABILITY_KEY: &str = "zigbee_availability";

/// A vendor topic convention: a predicate on message shape plus a rewrite
///
/// Implementations must be pure functions of the topic and payload; the
/// chain owner decides priority order.
pub trait TopicScheme: Send + Sync {
    /// Convention name, used for logging only
    fn name(&self) -> &'static str;

    /// Check whether this convention applies to the message
    fn matches(&self, topic: &str, payload: &Value) -> bool;

    /// Rewrite the message into `(canonical topic, payload)`
    ///
    /// Returning a non-mapping payload (or an empty mapping) marks the
    /// message as uninterpretable under this convention.
    fn rewrite(&self, topic: &str, payload: Value) -> (String, Value);
}

/// Z-Wave-to-MQTT named topics: `<prefix>/<node path>/endpoint_<n>/<property...>`
///
/// The endpoint segment separates the sensor identity from the property
/// path. Only applies to value publications (mapping payload with a `value`
/// field); `node_info` topics and endpoint-less topics are dropped.
struct ZwaveScheme {
    prefix: String,
}

impl TopicScheme for ZwaveScheme {
    fn name(&self) -> &'static str {
        "zwave2mqtt"
    }

    fn matches(&self, topic: &str, _payload: &Value) -> bool {
        !self.prefix.is_empty() && topic.starts_with(&self.prefix)
    }

    fn rewrite(&self, topic: &str, payload: Value) -> (String, Value) {
        if topic.contains("node_info") || !topic.contains("endpoint_") {
            return (topic.to_string(), Value::Object(Map::new()));
        }

        let value = match &payload {
            Value::Object(map) => match map.get("value") {
                Some(value) => value.clone(),
                None => return (topic.to_string(), Value::Object(Map::new())),
            },
            _ => return (topic.to_string(), Value::Object(Map::new())),
        };

        let segments: Vec<&str> = topic.split('/').collect();
        let endpoint = match segments.iter().position(|s| s.starts_with("endpoint_")) {
            Some(index) => index,
            None => return (topic.to_string(), Value::Object(Map::new())),
        };

        let canonical = segments[..=endpoint].join("/").to_lowercase();
        let property = segments[endpoint + 1..].join("_").to_lowercase();

        let mut map = Map::new();
        map.insert(property, value);
        (canonical, Value::Object(map))
    }
}

/// Hubitat topics: `<prefix>/<hub>/<room>/<metric>/value`
struct HubitatScheme {
    prefixes: Vec<String>,
}

impl TopicScheme for HubitatScheme {
    fn name(&self) -> &'static str {
        "hubitat"
    }

    fn matches(&self, topic: &str, _payload: &Value) -> bool {
        self.prefixes
            .iter()
            .any(|p| !p.is_empty() && topic.starts_with(p))
    }

    fn rewrite(&self, topic: &str, payload: Value) -> (String, Value) {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() < 3 {
            return (topic.to_string(), payload);
        }

        let canonical = format!(
            "{}_{}_{}",
            segments[0].to_lowercase(),
            segments[1].to_lowercase(),
            segments[2].to_lowercase()
        );
        let key = segments[segments.len() - 2].to_string();

        let mut map = Map::new();
        map.insert(key, payload);
        (canonical, Value::Object(map))
    }
}

/// ESPHome default state topics: `<prefix>/<component type>/<name>/state`
struct EsphomeScheme {
    prefixes: Vec<String>,
}

impl TopicScheme for EsphomeScheme {
    fn name(&self) -> &'static str {
        "esphome"
    }

    fn matches(&self, topic: &str, _payload: &Value) -> bool {
        self.prefixes
            .iter()
            .any(|p| !p.is_empty() && topic.starts_with(p))
    }

    fn rewrite(&self, topic: &str, payload: Value) -> (String, Value) {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() < 2 {
            return (topic.to_string(), Value::Object(Map::new()));
        }

        let canonical = format!(
            "{}/{}",
            segments[0].to_lowercase(),
            segments[1].to_lowercase()
        );
        let key = segments[segments.len() - 2].to_string();

        let mut map = Map::new();
        map.insert(key, payload);
        (canonical, Value::Object(map))
    }
}

/// Fallback for bare-value payloads: the last topic segment is the metric name
///
/// Used by Shelly sensors and single-value custom integrations. The
/// canonical topic is either everything up to the metric segment or just the
/// first two segments, depending on `keep_full_topic`.
struct NameInTopicScheme {
    keep_full_topic: bool,
}

impl TopicScheme for NameInTopicScheme {
    fn name(&self) -> &'static str {
        "name-in-topic"
    }

    fn matches(&self, _topic: &str, payload: &Value) -> bool {
        !payload.is_object()
    }

    fn rewrite(&self, topic: &str, payload: Value) -> (String, Value) {
        let segments: Vec<&str> = topic.split('/').collect();

        let canonical = if self.keep_full_topic {
            segments[..segments.len() - 1].join("/").to_lowercase()
        } else if segments.len() >= 2 {
            format!("{}/{}", segments[0], segments[1]).to_lowercase()
        } else {
            return (topic.to_string(), Value::Object(Map::new()));
        };

        let key = segments[segments.len() - 1].to_string();
        let mut map = Map::new();
        map.insert(key, payload);
        (canonical, Value::Object(map))
    }
}

/// Ordered chain of vendor conventions plus the availability rewrite
pub struct TopicNormalizer {
    schemes: Vec<Box<dyn TopicScheme>>,
    zigbee2mqtt_availability: bool,
}

impl TopicNormalizer {
    /// Build the chain from pipeline configuration
    ///
    /// Priority order is fixed: Z-Wave, Hubitat, ESPHome, then the
    /// name-in-topic fallback for non-mapping payloads. Mapping payloads that
    /// match no convention pass through unchanged.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let schemes: Vec<Box<dyn TopicScheme>> = vec![
            Box::new(ZwaveScheme {
                prefix: config.zwave_topic_prefix.clone(),
            }),
            Box::new(HubitatScheme {
                prefixes: config.hubitat_topic_prefixes.clone(),
            }),
            Box::new(EsphomeScheme {
                prefixes: config.esphome_topic_prefixes.clone(),
            }),
            Box::new(NameInTopicScheme {
                keep_full_topic: config.keep_full_topic,
            }),
        ];

        Self {
            schemes,
            zigbee2mqtt_availability: config.zigbee2mqtt_availability,
        }
    }

    /// Build a chain from explicit schemes, in priority order
    ///
    /// Lets integrations add their own conventions without touching the
    /// built-in dispatcher.
    pub fn with_schemes(
        schemes: Vec<Box<dyn TopicScheme>>,
        zigbee2mqtt_availability: bool,
    ) -> Self {
        Self {
            schemes,
            zigbee2mqtt_availability,
        }
    }

    /// Normalize a message into `(canonical topic, mapping payload)`
    ///
    /// The canonical topic has every `/` replaced by `_`. An empty returned
    /// mapping means normalization failed and the message should be dropped.
    pub fn normalize(&self, raw_topic: &str, payload: Value) -> (String, Map<String, Value>) {
        let (topic, payload) = match self
            .schemes
            .iter()
            .find(|s| s.matches(raw_topic, &payload))
        {
            Some(scheme) => {
                debug!(scheme = scheme.name(), topic = raw_topic, "normalizing topic");
                scheme.rewrite(raw_topic, payload)
            }
            None => (raw_topic.to_string(), payload),
        };

        let (topic, payload) = if self.zigbee2mqtt_availability {
            rewrite_availability(topic, payload)
        } else {
            (topic, payload)
        };

        let topic = topic.replace('/', "_");
        match payload {
            Value::Object(map) => (topic, map),
            other => {
                debug!(%topic, payload = %other, "payload did not normalize to a mapping");
                (topic, Map::new())
            }
        }
    }
}

/// Move the availability suffix from the topic into the payload
///
/// `zigbee2mqtt/garage/availability` with a `state` field becomes the
/// `zigbee_availability` series on topic `zigbee2mqtt/garage`, so presence
/// is reported alongside the device's normal metrics.
fn rewrite_availability(topic: String, payload: Value) -> (String, Value) {
    if !topic.ends_with(AVAILABILITY_SUFFIX) {
        return (topic, payload);
    }

    let state = match &payload {
        Value::Object(map) => match map.get("state") {
            Some(state) => state.clone(),
            None => return (topic, payload),
        },
        _ => return (topic, payload),
    };

    let trimmed = topic[..topic.len() - AVAILABILITY_SUFFIX.len()].to_string();
    let mut map = Map::new();
    map.insert(AVAILABILITY_KEY.to_string(), state);
    (trimmed, Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer(config: &PipelineConfig) -> TopicNormalizer {
        TopicNormalizer::from_config(config)
    }

    #[test]
    fn test_already_structured_passthrough() {
        let config = PipelineConfig::default();
        let (topic, payload) = normalizer(&config).normalize(
            "zigbee2mqtt/0x00157d00032b1234",
            json!({"temperature": 26.24, "humidity": 45.37}),
        );
        assert_eq!(topic, "zigbee2mqtt_0x00157d00032b1234");
        assert_eq!(payload.get("temperature"), Some(&json!(26.24)));
        assert_eq!(payload.get("humidity"), Some(&json!(45.37)));
    }

    #[test]
    fn test_name_in_topic() {
        let config = PipelineConfig::default();
        let (topic, payload) =
            normalizer(&config).normalize("shellies/room/sensor/temperature", json!(20.00));
        assert_eq!(topic, "shellies_room");
        assert_eq!(payload.get("temperature"), Some(&json!(20.00)));
    }

    #[test]
    fn test_name_in_topic_keep_full_topic() {
        let config = PipelineConfig {
            keep_full_topic: true,
            ..Default::default()
        };
        let (topic, payload) =
            normalizer(&config).normalize("shellies/room/sensor/temperature", json!(20.00));
        assert_eq!(topic, "shellies_room_sensor");
        assert_eq!(payload.get("temperature"), Some(&json!(20.00)));
    }

    #[test]
    fn test_name_in_topic_single_segment_fails() {
        let config = PipelineConfig::default();
        let (_, payload) = normalizer(&config).normalize("temperature", json!(20.00));
        assert!(payload.is_empty());
    }

    #[test]
    fn test_zwave_endpoint_topic() {
        let config = PipelineConfig::default();
        let (topic, payload) = normalizer(&config).normalize(
            "zwave/BackRoom/Multisensor/sensor_multilevel/endpoint_0/Air_temperature",
            json!({"value": 83.2}),
        );
        assert_eq!(
            topic,
            "zwave_backroom_multisensor_sensor_multilevel_endpoint_0"
        );
        assert_eq!(payload.get("air_temperature"), Some(&json!(83.2)));
    }

    #[test]
    fn test_zwave_property_key_joined() {
        let config = PipelineConfig::default();
        let (topic, payload) = normalizer(&config).normalize(
            "zwave/Stereo/PowerStrip/meter/endpoint_1/value/66049",
            json!({"value": 3.2}),
        );
        assert_eq!(topic, "zwave_stereo_powerstrip_meter_endpoint_1");
        assert_eq!(payload.get("value_66049"), Some(&json!(3.2)));
    }

    #[test]
    fn test_zwave_node_info_dropped() {
        let config = PipelineConfig::default();
        let (_, payload) = normalizer(&config).normalize(
            "zwave/BackRoom/Multisensor/node_info",
            json!({"value": 1}),
        );
        assert!(payload.is_empty());
    }

    #[test]
    fn test_zwave_requires_value_field() {
        let config = PipelineConfig::default();
        let (_, payload) = normalizer(&config).normalize(
            "zwave/BackRoom/Multisensor/sensor_multilevel/endpoint_0/Air_temperature",
            json!({"reading": 83.2}),
        );
        assert!(payload.is_empty());
    }

    #[test]
    fn test_hubitat_topic() {
        let config = PipelineConfig::default();
        let (topic, payload) = normalizer(&config).normalize(
            "hubitat/hub1/some room/temperature/value",
            json!(21.5),
        );
        assert_eq!(topic, "hubitat_hub1_some room");
        assert_eq!(payload.get("temperature"), Some(&json!(21.5)));
    }

    #[test]
    fn test_esphome_topic() {
        let config = PipelineConfig {
            esphome_topic_prefixes: vec!["esphome/".to_string()],
            ..Default::default()
        };
        let (topic, payload) =
            normalizer(&config).normalize("esphome/sensor/temperature/state", json!(22.1));
        assert_eq!(topic, "esphome_sensor");
        assert_eq!(payload.get("temperature"), Some(&json!(22.1)));
    }

    #[test]
    fn test_availability_rewrite() {
        let config = PipelineConfig {
            zigbee2mqtt_availability: true,
            ..Default::default()
        };
        let (topic, payload) = normalizer(&config).normalize(
            "zigbee2mqtt/garage/availability",
            json!({"state": "online"}),
        );
        assert_eq!(topic, "zigbee2mqtt_garage");
        assert_eq!(payload.get("zigbee_availability"), Some(&json!("online")));
    }

    #[test]
    fn test_availability_disabled_passthrough() {
        let config = PipelineConfig::default();
        let (topic, payload) = normalizer(&config).normalize(
            "zigbee2mqtt/garage/availability",
            json!({"state": "online"}),
        );
        assert_eq!(topic, "zigbee2mqtt_garage_availability");
        assert_eq!(payload.get("state"), Some(&json!("online")));
    }

    #[test]
    fn test_custom_scheme_chain() {
        struct FixedScheme;

        impl TopicScheme for FixedScheme {
            fn name(&self) -> &'static str {
                "fixed"
            }

            fn matches(&self, topic: &str, _payload: &Value) -> bool {
                topic.starts_with("custom/")
            }

            fn rewrite(&self, _topic: &str, payload: Value) -> (String, Value) {
                let mut map = Map::new();
                map.insert("reading".to_string(), payload);
                ("custom/device".to_string(), Value::Object(map))
            }
        }

        let normalizer = TopicNormalizer::with_schemes(vec![Box::new(FixedScheme)], false);
        let (topic, payload) = normalizer.normalize("custom/anything", json!(7));
        assert_eq!(topic, "custom_device");
        assert_eq!(payload.get("reading"), Some(&json!(7)));
    }

    #[test]
    fn test_unparseable_payload_fails_closed() {
        let config = PipelineConfig::default();
        // single-segment topic defeats the name-in-topic fallback
        let (topic, payload) = normalizer(&config).normalize("standalone", json!(5));
        assert_eq!(topic, "standalone");
        assert!(payload.is_empty());
    }
}
