// MQTT2Prom - Generic MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Dynamic metric registry
//!
//! Owns the mapping from series identity (name + label-key set) to the
//! lazily created gauge exposed for it, enforces the configured series
//! budget, and tracks which labeled samples each original topic contributed
//! so a device rename can evict exactly those samples.
//!
//! The registry wraps its own [`prometheus::Registry`] instance; nothing
//! here touches the process-wide default registry.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::error::{BridgeError, Result};

/// Label holding the client identifier when exposure is enabled
const CLIENT_ID_LABEL: &str = "client_id";

/// Suffix of the last-seen shadow series
const LAST_SEEN_SUFFIX: &str = "_ts";

/// Identity of one logical series: name plus the set of extra label keys
///
/// Two identities are equal iff name and label-key set match; the key set is
/// kept sorted so equality is order-insensitive and display order is stable.
/// The fixed topic and client-id labels are implicit and not part of the
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesId {
    name: String,
    label_keys: Vec<String>,
}

impl SeriesId {
    /// Create an identity; label keys are sorted into canonical order
    pub fn new(name: impl Into<String>, mut label_keys: Vec<String>) -> Self {
        label_keys.sort();
        Self {
            name: name.into(),
            label_keys,
        }
    }

    /// Series name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extra label keys, in canonical order
    pub fn label_keys(&self) -> &[String] {
        &self.label_keys
    }

    /// Identity of the last-seen shadow series
    fn shadow(&self) -> SeriesId {
        SeriesId {
            name: format!("{}{}", self.name, LAST_SEEN_SUFFIX),
            label_keys: self.label_keys.clone(),
        }
    }
}

impl std::fmt::Display for SeriesId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.name, self.label_keys.join(","))
    }
}

/// A registered series: identity, declared labels and the backing gauge
pub struct RegisteredSeries {
    id: SeriesId,
    label_names: Vec<String>,
    gauge: GaugeVec,
    created_order: usize,
}

impl RegisteredSeries {
    /// Series identity
    pub fn id(&self) -> &SeriesId {
        &self.id
    }

    /// Full declared label list: topic label, optional client id, extra keys
    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    /// Creation sequence number within the registry
    pub fn created_order(&self) -> usize {
        self.created_order
    }
}

/// One labeled sample recorded under an original topic
struct SampleRef {
    id: SeriesId,
    label_values: Vec<String>,
}

/// Registry of dynamically created series
pub struct MetricRegistry {
    registry: Registry,
    series: HashMap<SeriesId, RegisteredSeries>,
    topic_index: HashMap<String, Vec<SampleRef>>,
    message_counter: CounterVec,
    topic_label: String,
    expose_client_id: bool,
    expose_last_seen: bool,
    max_metrics: usize,
    next_order: usize,
}

impl MetricRegistry {
    /// Create an empty registry and its receipt counter
    ///
    /// # Errors
    ///
    /// Returns an error if the receipt counter cannot be registered, which
    /// only happens with an invalid prefix or topic label.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let registry = Registry::new();

        let mut counter_labels = vec![config.topic_label.as_str()];
        if config.expose_client_id {
            counter_labels.push(CLIENT_ID_LABEL);
        }
        let message_counter = CounterVec::new(
            Opts::new(
                format!("{}message_total", config.metric_prefix),
                "Counter of received messages",
            ),
            &counter_labels,
        )?;
        registry.register(Box::new(message_counter.clone()))?;

        Ok(Self {
            registry,
            series: HashMap::new(),
            topic_index: HashMap::new(),
            message_counter,
            topic_label: config.topic_label.clone(),
            expose_client_id: config.expose_client_id,
            expose_last_seen: config.expose_last_seen,
            max_metrics: config.max_metrics,
            next_order: 0,
        })
    }

    /// Ensure a series exists for the identity, creating it lazily
    ///
    /// Existing identities always succeed, regardless of the budget. New
    /// identities are refused with [`BridgeError::CardinalityExceeded`] when
    /// the budget is full, without touching any state.
    pub fn get_or_create(&mut self, id: &SeriesId, original_topic: &str) -> Result<()> {
        if self.series.contains_key(id) {
            return Ok(());
        }

        // A refused create must leave no partial state, so the budget check
        // accounts for the shadow series up front.
        let needed = if self.expose_last_seen { 2 } else { 1 };
        if self.max_metrics > 0 && self.series.len() + needed > self.max_metrics {
            return Err(BridgeError::CardinalityExceeded {
                name: id.name().to_string(),
                max: self.max_metrics,
            });
        }

        let label_names = self.full_label_names(id);
        let gauge = self.register_gauge(
            id.name(),
            "metric generated from MQTT message.",
            &label_names,
        )?;
        self.insert_series(id.clone(), label_names.clone(), gauge);
        info!(series = %id, "creating prometheus series");

        if self.expose_last_seen {
            let ts_id = id.shadow();
            match self.register_gauge(
                ts_id.name(),
                "timestamp of metric generated from MQTT message.",
                &label_names,
            ) {
                Ok(gauge) => self.insert_series(ts_id, label_names, gauge),
                // primary stays registered; the shadow is best-effort
                Err(e) => error!(series = %ts_id, "failed to create last-seen series: {e}"),
            }
        }

        self.topic_index.entry(original_topic.to_string()).or_default();
        Ok(())
    }

    /// Record a sample for an existing identity
    ///
    /// Samples for identities that were never created (e.g. refused by the
    /// budget) are dropped silently. The labeled sample is remembered
    /// against `original_topic` for later eviction.
    pub fn record_sample(
        &mut self,
        id: &SeriesId,
        topic: &str,
        client_id: Option<&str>,
        extra_labels: &BTreeMap<String, String>,
        value: f64,
        original_topic: &str,
    ) {
        let gauge = match self.series.get(id) {
            Some(series) => series.gauge.clone(),
            None => return,
        };

        let mut label_values: Vec<String> = vec![topic.to_string()];
        if let Some(client_id) = client_id {
            label_values.push(client_id.to_string());
        }
        label_values.extend(extra_labels.values().cloned());
        let value_refs: Vec<&str> = label_values.iter().map(String::as_str).collect();

        match gauge.get_metric_with_label_values(&value_refs) {
            Ok(metric) => metric.set(value),
            Err(e) => {
                error!(series = %id, "label mismatch on sample: {e}");
                return;
            }
        }
        debug!(series = %id, value, "new sample");
        self.remember(original_topic, id, &label_values);

        if self.expose_last_seen {
            let ts_id = id.shadow();
            if let Some(shadow) = self.series.get(&ts_id).map(|s| s.gauge.clone()) {
                if let Ok(metric) = shadow.get_metric_with_label_values(&value_refs) {
                    metric.set(unix_timestamp());
                    self.remember(original_topic, &ts_id, &label_values);
                }
            }
        }
    }

    /// Remove every labeled sample previously recorded under a topic
    ///
    /// Series objects themselves survive; only the label-value combinations
    /// contributed by this topic disappear from exposition. The topic's
    /// index entry is dropped entirely, so a second eviction is a no-op.
    /// Returns the number of samples removed.
    pub fn evict_topic(&mut self, topic: &str) -> usize {
        let refs = match self.topic_index.remove(topic) {
            Some(refs) => refs,
            None => return 0,
        };

        let mut removed = 0;
        for sample in &refs {
            if let Some(series) = self.series.get(&sample.id) {
                let value_refs: Vec<&str> =
                    sample.label_values.iter().map(String::as_str).collect();
                if series.gauge.remove_label_values(&value_refs).is_ok() {
                    removed += 1;
                }
            }
        }
        debug!(topic, removed, "evicted topic samples");
        removed
    }

    /// Increment the receipt counter for a canonical topic
    pub fn inc_message_count(&self, topic: &str, client_id: Option<&str>) {
        let mut values = vec![topic];
        if let Some(client_id) = client_id {
            values.push(client_id);
        }
        match self.message_counter.get_metric_with_label_values(&values) {
            Ok(counter) => counter.inc(),
            Err(e) => error!(topic, "receipt counter label mismatch: {e}"),
        }
    }

    /// Look up a registered series
    pub fn get(&self, id: &SeriesId) -> Option<&RegisteredSeries> {
        self.series.get(id)
    }

    /// Check whether an identity exists
    pub fn contains(&self, id: &SeriesId) -> bool {
        self.series.contains_key(id)
    }

    /// Number of registered series, shadows included
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Number of original topics with recorded samples
    pub fn tracked_topics(&self) -> usize {
        self.topic_index.len()
    }

    /// Snapshot of all metric families for exposition
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Render the current exposition snapshot in the Prometheus text format
    pub fn encode_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.gather(), &mut buffer) {
            error!("failed to encode metrics: {e}");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    fn full_label_names(&self, id: &SeriesId) -> Vec<String> {
        let mut names = vec![self.topic_label.clone()];
        if self.expose_client_id {
            names.push(CLIENT_ID_LABEL.to_string());
        }
        names.extend(id.label_keys().iter().cloned());
        names
    }

    fn register_gauge(&self, name: &str, help: &str, label_names: &[String]) -> Result<GaugeVec> {
        let name_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let gauge = GaugeVec::new(Opts::new(name, help), &name_refs)?;
        self.registry.register(Box::new(gauge.clone()))?;
        Ok(gauge)
    }

    fn insert_series(&mut self, id: SeriesId, label_names: Vec<String>, gauge: GaugeVec) {
        let created_order = self.next_order;
        self.next_order += 1;
        self.series.insert(
            id.clone(),
            RegisteredSeries {
                id,
                label_names,
                gauge,
                created_order,
            },
        );
    }

    fn remember(&mut self, original_topic: &str, id: &SeriesId, label_values: &[String]) {
        let entry = self.topic_index.entry(original_topic.to_string()).or_default();
        if !entry
            .iter()
            .any(|r| r.id == *id && r.label_values == label_values)
        {
            entry.push(SampleRef {
                id: id.clone(),
                label_values: label_values.to_vec(),
            });
        }
    }
}

/// Current time as Unix seconds, 0 if the clock is unavailable
fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as f64)
        .unwrap_or(0.0)
}
