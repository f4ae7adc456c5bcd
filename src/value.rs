// MQTT2Prom - Generic MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Leaf value parsing
//!
//! Converts a single untyped scalar (number, boolean, state word, numeric
//! string) into an `f64`, or reports [`BridgeError::NotNumeric`]. Structured
//! values are never recursed into here; the flattener hands over leaves only.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Built-in state tokens reported by switches and presence sensors
const DEFAULT_STATE_VALUES: [(&str, f64); 6] = [
    ("ON", 1.0),
    ("OFF", 0.0),
    ("TRUE", 1.0),
    ("FALSE", 0.0),
    ("ONLINE", 1.0),
    ("OFFLINE", 0.0),
];

/// Table mapping state tokens to numeric substitutes
///
/// Keys are stored upper-cased. [`StateValues::get`] folds its argument
/// before lookup (for leaf values inside payloads); [`StateValues::get_exact`]
/// does not (for whole-payload tokens, which must match as published).
#[derive(Debug, Clone)]
pub struct StateValues {
    map: HashMap<String, f64>,
}

impl Default for StateValues {
    fn default() -> Self {
        let map = DEFAULT_STATE_VALUES
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        Self { map }
    }
}

impl StateValues {
    /// Build the table from the defaults plus user overrides
    ///
    /// Override keys are upper-cased on insertion and take precedence over
    /// the built-in entries.
    pub fn with_overrides(overrides: &[(String, f64)]) -> Self {
        let mut table = Self::default();
        for (key, value) in overrides {
            table.map.insert(key.to_uppercase(), *value);
        }
        table
    }

    /// Case-insensitive lookup
    pub fn get(&self, token: &str) -> Option<f64> {
        self.map.get(&token.to_uppercase()).copied()
    }

    /// Case-sensitive lookup against the stored (upper-cased) keys
    pub fn get_exact(&self, token: &str) -> Option<f64> {
        self.map.get(token).copied()
    }

    /// Number of known tokens
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Parse a leaf value into a float
///
/// Numbers pass through, booleans map to 1/0, strings are resolved through
/// the state table and then as numeric literals. Anything structured or null
/// is an error: the caller recurses into structure before calling this.
///
/// # Errors
///
/// Returns [`BridgeError::NotNumeric`] when no conversion applies.
pub fn parse_scalar(value: &Value, states: &StateValues) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| BridgeError::NotNumeric(n.to_string())),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            if let Some(mapped) = states.get(s) {
                return Ok(mapped);
            }
            s.trim()
                .parse::<f64>()
                .map_err(|_| BridgeError::NotNumeric(s.clone()))
        }
        other => Err(BridgeError::NotNumeric(other.to_string())),
    }
}
