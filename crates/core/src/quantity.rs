//! Resource quantity parsing and rendering.
//!
//! Capacity/allocatable CPU, live-usage CPU and memory each arrive in a slightly
//! different textual encoding. The `try_*` functions are strict; the `parse_*`
//! wrappers never fail and resolve malformed input to zero with a warning.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Sentinel reported by the control plane when a value is not yet known.
pub const UNKNOWN: &str = "<unknown>";

const MEMORY_UNITS: [&str; 5] = ["B", "Ki", "Mi", "Gi", "Ti"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuantityError {
    #[error("invalid number {raw:?}")]
    InvalidNumber { raw: String },
    #[error("quantity {raw:?} overflows")]
    Overflow { raw: String },
}

impl QuantityError {
    fn invalid(raw: &str) -> Self { QuantityError::InvalidNumber { raw: raw.to_string() } }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Unit {
    Cores,
    Bytes,
}

/// Normalized value: cores for CPU, bytes for memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn cores(value: f64) -> Self { Self { value, unit: Unit::Cores } }
    pub fn bytes(value: f64) -> Self { Self { value, unit: Unit::Bytes } }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.unit {
            Unit::Cores => {
                if self.value < 1.0 {
                    write!(f, "{}m", (self.value * 1000.0) as i64)
                } else {
                    write!(f, "{:.1}", self.value)
                }
            }
            Unit::Bytes => {
                let mut value = self.value;
                let mut idx = 0;
                while value >= 1024.0 && idx < MEMORY_UNITS.len() - 1 {
                    value /= 1024.0;
                    idx += 1;
                }
                write!(f, "{:.1}{}", value, MEMORY_UNITS[idx])
            }
        }
    }
}

pub fn format_cpu(cores: f64) -> String { Quantity::cores(cores).to_string() }

pub fn format_memory(bytes: f64) -> String { Quantity::bytes(bytes).to_string() }

fn decimal(raw: &str, digits: &str) -> Result<f64, QuantityError> {
    let v: f64 = digits.parse().map_err(|_| QuantityError::invalid(raw))?;
    if !v.is_finite() || v < 0.0 {
        return Err(QuantityError::invalid(raw));
    }
    Ok(v)
}

/// Capacity/allocatable CPU: `"2"`, `"1.5"`, `"500m"` or `<unknown>`.
pub fn try_parse_cpu(raw: &str) -> Result<f64, QuantityError> {
    let s = raw.trim();
    if s == UNKNOWN {
        return Ok(0.0);
    }
    match s.strip_suffix('m') {
        Some(milli) => Ok(decimal(raw, milli)? / 1_000.0),
        None => decimal(raw, s),
    }
}

/// Usage CPU from the metrics API: nanocores (`n`), microcores (`u`), millicores (`m`)
/// or plain cores.
pub fn try_parse_usage_cpu(raw: &str) -> Result<f64, QuantityError> {
    let s = raw.trim();
    if s == UNKNOWN {
        return Ok(0.0);
    }
    if let Some(n) = s.strip_suffix('n') {
        return Ok(decimal(raw, n)? / 1_000_000_000.0);
    }
    if let Some(u) = s.strip_suffix('u') {
        return Ok(decimal(raw, u)? / 1_000_000.0);
    }
    if let Some(m) = s.strip_suffix('m') {
        return Ok(decimal(raw, m)? / 1_000.0);
    }
    decimal(raw, s)
}

/// Memory: `Ki`/`Mi`/`Gi` binary suffixes or plain bytes.
pub fn try_parse_memory(raw: &str) -> Result<u64, QuantityError> {
    let s = raw.trim();
    if s == UNKNOWN {
        return Ok(0);
    }
    let (digits, mult) = if let Some(d) = s.strip_suffix("Ki") {
        (d, 1u64 << 10)
    } else if let Some(d) = s.strip_suffix("Mi") {
        (d, 1u64 << 20)
    } else if let Some(d) = s.strip_suffix("Gi") {
        (d, 1u64 << 30)
    } else {
        (s, 1)
    };
    let n: u64 = digits.parse().map_err(|_| QuantityError::invalid(raw))?;
    n.checked_mul(mult).ok_or_else(|| QuantityError::Overflow { raw: raw.to_string() })
}

pub fn parse_cpu(raw: &str) -> f64 {
    try_parse_cpu(raw).unwrap_or_else(|e| {
        warn!(raw = %raw, error = %e, "unparseable cpu quantity; using 0");
        0.0
    })
}

pub fn parse_usage_cpu(raw: &str) -> f64 {
    try_parse_usage_cpu(raw).unwrap_or_else(|e| {
        warn!(raw = %raw, error = %e, "unparseable cpu usage; using 0");
        0.0
    })
}

pub fn parse_memory(raw: &str) -> u64 {
    try_parse_memory(raw).unwrap_or_else(|e| {
        warn!(raw = %raw, error = %e, "unparseable memory quantity; using 0");
        0
    })
}
