// MQTT2Prom - Generic MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Series and label name sanitization
//!
//! Two independent grammars, both idempotent:
//!
//! - metric names: `[a-zA-Z_:][a-zA-Z0-9_:]*`
//! - label names: `[a-zA-Z_][a-zA-Z0-9_]*`, no leading `__` (reserved)
//!
//! Invalid characters are stripped, not replaced. Non-ASCII input is always
//! stripped. [`clean_metric_path`] runs first on flattened payload paths to
//! collapse common vendor naming (units in parentheses, dotted firmware
//! fields, dashed sensor ids) into stable identifiers.

/// Transform a candidate into a valid Prometheus series name
///
/// Strips anything outside `[a-zA-Z0-9_:]` and prefixes `:` when the result
/// does not start with a letter, underscore or colon.
pub fn sanitize_metric_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == ':')
        .collect();

    match cleaned.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => cleaned,
        _ => format!(":{cleaned}"),
    }
}

/// Transform a candidate into a valid Prometheus label name
///
/// Strips anything outside `[a-zA-Z0-9_]`, prefixes `_` when the result does
/// not start with a letter or underscore, and collapses a reserved `__`
/// prefix to a single underscore.
pub fn sanitize_label_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    let prefixed = match cleaned.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => cleaned,
        _ => format!("_{cleaned}"),
    };

    match prefixed.strip_prefix("__") {
        Some(rest) => format!("_{rest}"),
        None => prefixed,
    }
}

/// Collapse a flattened payload path into a stable metric identifier
///
/// Dots, dashes and parenthesized spans (vendor units such as `(W)`) are
/// dropped, spaces and slashes become underscores, and the path is ASCII
/// lower-cased. An unmatched `(` is kept literally.
pub fn clean_metric_path(path: &str) -> String {
    let chars: Vec<char> = path.chars().collect();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '(' {
            if let Some(offset) = chars[i + 1..].iter().position(|&c| c == ')') {
                i += offset + 2;
                continue;
            }
        }
        match c {
            '.' | '-' => {}
            ' ' | '/' => out.push('_'),
            _ => out.push(c.to_ascii_lowercase()),
        }
        i += 1;
    }

    out
}
