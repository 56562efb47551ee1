//! Criterion parsing and comparison

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::standard::number;

/// Comparison applied as `statistic <op> expected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
}

impl Comparison {
    fn parse(op: &str) -> Option<Self> {
        match op.trim() {
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "==" | "=" => Some(Self::Eq),
            _ => None,
        }
    }

    #[allow(clippy::float_cmp)]
    fn holds(self, measured: f64, expected: f64) -> bool {
        match self {
            Self::Lt => measured < expected,
            Self::Le => measured <= expected,
            Self::Gt => measured > expected,
            Self::Ge => measured >= expected,
            Self::Eq => measured == expected,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
        })
    }
}

/// What a criterion expects of its statistic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expected {
    /// Numeric threshold
    Threshold {
        /// Comparison operator
        op: Comparison,
        /// Threshold value
        value: f64,
    },
    /// Boolean flag that must match exactly
    Flag(bool),
}

/// One parsed pass criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    key: String,
    expected: Expected,
}

pub(super) struct Alias {
    pub(super) criterion: &'static str,
    pub(super) stat: &'static str,
    op: Comparison,
}

/// Legacy criterion names used by existing standard definitions.
const ALIASES: &[Alias] = &[
    Alias { criterion: "max_time", stat: "response_time_s", op: Comparison::Le },
    Alias { criterion: "shutdown_time", stat: "response_time_s", op: Comparison::Le },
    Alias { criterion: "success_rate", stat: "communication_success_pct", op: Comparison::Ge },
    Alias { criterion: "response_rate", stat: "remote_response_pct", op: Comparison::Ge },
    Alias { criterion: "restart_time", stat: "restart_time_s", op: Comparison::Le },
    Alias { criterion: "stability", stat: "power_stability_pct", op: Comparison::Ge },
    Alias { criterion: "min_efficiency", stat: "efficiency_pct", op: Comparison::Ge },
    Alias { criterion: "max_temp_rise", stat: "temperature_rise_c", op: Comparison::Le },
    Alias { criterion: "leakage_limit", stat: "max_leakage", op: Comparison::Le },
];

pub(super) fn alias(key: &str) -> Option<&'static Alias> {
    ALIASES.iter().find(|a| a.criterion == key)
}

/// The statistic a criterion key resolves to when no tagged lookup applies.
#[must_use]
pub fn canonical_stat_key(key: &str) -> String {
    if let Some(alias) = alias(key) {
        return alias.stat.to_string();
    }
    key.strip_prefix("min_")
        .or_else(|| key.strip_prefix("max_"))
        .unwrap_or(key)
        .to_string()
}

impl Criterion {
    /// Infer a criterion from its key and declared value.
    ///
    /// # Errors
    ///
    /// Returns the failure reason when the declared value has no supported
    /// type; the evaluation engine reports it as a failed criterion.
    pub fn parse(key: &str, declared: &Value) -> std::result::Result<Self, String> {
        let expected = match declared {
            Value::Bool(flag) => Expected::Flag(*flag),
            Value::Object(object) => {
                let op = object
                    .get("op")
                    .and_then(Value::as_str)
                    .and_then(Comparison::parse)
                    .ok_or_else(|| format!("criterion {key}: missing or unknown \"op\""))?;
                match object.get("value") {
                    Some(Value::Bool(flag)) if op == Comparison::Eq => Expected::Flag(*flag),
                    Some(value) => Expected::Threshold {
                        op,
                        value: number(value)
                            .ok_or_else(|| format!("criterion {key}: \"value\" is not numeric"))?,
                    },
                    None => return Err(format!("criterion {key}: missing \"value\"")),
                }
            }
            other => {
                let value = number(other).ok_or_else(|| {
                    format!("criterion {key}: unsupported declared type {other}")
                })?;
                let op = alias(key).map_or_else(
                    || {
                        if key.starts_with("min_") {
                            Comparison::Ge
                        } else {
                            Comparison::Le
                        }
                    },
                    |a| a.op,
                );
                Expected::Threshold { op, value }
            }
        };
        Ok(Self {
            key: key.to_string(),
            expected,
        })
    }

    /// Criterion key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Expected value and comparison.
    #[must_use]
    pub const fn expected(&self) -> Expected {
        self.expected
    }

    /// Compare a measured statistic; `Err` carries the failure reason.
    pub(super) fn check(&self, stat_key: &str, measured: &Value) -> std::result::Result<(), String> {
        let key = &self.key;
        match self.expected {
            Expected::Flag(flag) => match measured.as_bool() {
                Some(actual) if actual == flag => Ok(()),
                Some(actual) => Err(format!("criterion {key}: {stat_key} is {actual}, required {flag}")),
                None => Err(format!(
                    "criterion {key}: {stat_key} = {measured} is not a boolean flag"
                )),
            },
            Expected::Threshold { op, value } => match number(measured) {
                Some(actual) if actual.is_finite() && op.holds(actual, value) => Ok(()),
                Some(actual) => Err(format!(
                    "criterion {key}: {stat_key} = {actual:.4} violates {op} {value}"
                )),
                None => Err(format!(
                    "criterion {key}: {stat_key} = {measured} is not numeric"
                )),
            },
        }
    }
}
