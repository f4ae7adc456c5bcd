// MQTT2Prom - Generic MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for MQTT2Prom

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Payload could not be decoded or parsed into a structured value
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Leaf value could not be converted to a number
    #[error("Not a numeric value: {0}")]
    NotNumeric(String),

    /// Metric budget reached, series creation refused
    #[error("Metric limit reached ({max}): refusing to create '{name}'")]
    CardinalityExceeded { name: String, max: usize },

    /// Exposition sink rejected a series registration
    #[error("Collector registration failed: {0}")]
    Collector(#[from] prometheus::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
