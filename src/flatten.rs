// MQTT2Prom - Generic MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Payload flattening
//!
//! Walks a nested JSON mapping depth-first and yields `(path, value)` pairs
//! for every scalar leaf, joining nesting levels with `_`. Sequences are
//! treated as mappings from stringified index to element, so element 0 of a
//! list `metric` becomes `metric_0`. Values are yielded unparsed; parse
//! failures are handled per leaf by the caller so one bad value never aborts
//! the walk.

use serde_json::{Map, Value};

/// Flatten a payload mapping into an iterator of `(path, leaf)` pairs
///
/// The iterator is lazy and restartable: flattening the same payload twice
/// yields the same sequence, in document order.
pub fn flatten(payload: &Map<String, Value>) -> FlattenedLeaves<'_> {
    let stack: Vec<(String, &Value)> = payload
        .iter()
        .rev()
        .map(|(key, value)| (key.clone(), value))
        .collect();
    FlattenedLeaves { stack }
}

/// Depth-first iterator over the scalar leaves of a payload
///
/// Created by [`flatten`].
#[derive(Debug)]
pub struct FlattenedLeaves<'a> {
    stack: Vec<(String, &'a Value)>,
}

impl<'a> Iterator for FlattenedLeaves<'a> {
    type Item = (String, &'a Value);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((path, value)) = self.stack.pop() {
            match value {
                Value::Object(map) => {
                    for (key, child) in map.iter().rev() {
                        self.stack.push((format!("{path}_{key}"), child));
                    }
                }
                Value::Array(items) => {
                    for (index, child) in items.iter().enumerate().rev() {
                        self.stack.push((format!("{path}_{index}"), child));
                    }
                }
                leaf => return Some((path, leaf)),
            }
        }
        None
    }
}
