//! Test standards and the read-only registry
//!
//! A [`Standard`] is a named bundle of test parameters and pass criteria for
//! one [`TestType`]. Parameters are free-form JSON: keys the engine does not
//! know are ignored, and known keys that are absent (or hold a descriptive
//! string instead of a number) fall back to documented per-test defaults.
//!
//! The [`StandardRegistry`] is built once and never mutated; share it behind
//! an `Arc` without locking.

pub mod defaults;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::experiment::MeasurementStore;
use crate::{Error, Result};

/// Kind of standardized test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    /// Dielectric withstand (hipot)
    Dielectric,
    /// Leakage current across environmental conditions
    Leakage,
    /// Normal operation: functional, shutdown timing, performance
    Normal,
    /// Abnormal operation: overload, short circuit, environmental stress
    Abnormal,
}

impl TestType {
    /// All test types.
    pub const ALL: [Self; 4] = [Self::Dielectric, Self::Leakage, Self::Normal, Self::Abnormal];

    /// Lower-case name as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dielectric => "dielectric",
            Self::Leakage => "leakage",
            Self::Normal => "normal",
            Self::Abnormal => "abnormal",
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameterized test standard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standard {
    code: String,
    name: String,
    test_type: TestType,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pass_criteria: BTreeMap<String, Value>,
}

impl Standard {
    /// Create a standard with no parameters or criteria.
    #[must_use]
    pub fn new(code: impl Into<String>, name: impl Into<String>, test_type: TestType) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            test_type,
            parameters: BTreeMap::new(),
            pass_criteria: BTreeMap::new(),
        }
    }

    /// Add or replace a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Add or replace a pass criterion.
    #[must_use]
    pub fn with_criterion(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pass_criteria.insert(key.into(), value.into());
        self
    }

    /// Unique code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Test type this standard parameterizes.
    #[must_use]
    pub const fn test_type(&self) -> TestType {
        self.test_type
    }

    /// All parameters.
    #[must_use]
    pub const fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    /// All pass criteria.
    #[must_use]
    pub const fn pass_criteria(&self) -> &BTreeMap<String, Value> {
        &self.pass_criteria
    }

    /// Raw parameter value.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Numeric parameter; numeric strings are accepted, anything else is absent.
    #[must_use]
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(number)
    }

    /// Numeric parameter with a default, rejecting negative or non-finite values.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the key and the standard if the
    /// stored value is numeric but negative or non-finite.
    pub fn non_negative_or(&self, key: &str, default: f64) -> Result<f64> {
        match self.param_f64(key) {
            None => Ok(default),
            Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
            Some(v) => Err(Error::Validation(format!(
                "standard {}: parameter {key} must be a non-negative number, got {v}",
                self.code
            ))),
        }
    }

    /// Duration parameter (s) with a default, bounded by [`MAX_DURATION_S`].
    ///
    /// # Errors
    ///
    /// Returns a validation error for negative, non-finite or longer values.
    pub fn duration_or(&self, key: &str, default: f64) -> Result<f64> {
        let value = self.non_negative_or(key, default)?;
        if value > MAX_DURATION_S {
            return Err(Error::Validation(format!(
                "standard {}: parameter {key} must be at most {MAX_DURATION_S} s, got {value}",
                self.code
            )));
        }
        Ok(value)
    }

    /// Numeric pass criterion; numeric strings are accepted.
    #[must_use]
    pub fn criterion_f64(&self, key: &str) -> Option<f64> {
        self.pass_criteria.get(key).and_then(number)
    }
}

/// Longest duration a standard may declare for any phase or window (one year).
pub const MAX_DURATION_S: f64 = 31_536_000.0;

/// Interpret a JSON value as a number if it plausibly is one.
pub(crate) fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Immutable lookup table of standards keyed by code.
#[derive(Debug, Clone, Default)]
pub struct StandardRegistry {
    by_code: FxHashMap<String, Arc<Standard>>,
}

impl StandardRegistry {
    /// Build from an explicit list.
    ///
    /// # Errors
    ///
    /// Returns a validation error on duplicate or empty codes.
    pub fn from_standards(standards: impl IntoIterator<Item = Standard>) -> Result<Self> {
        let mut by_code = FxHashMap::default();
        for standard in standards {
            if standard.code.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "standard {:?} has an empty code",
                    standard.name
                )));
            }
            let code = standard.code.clone();
            if by_code.insert(code.clone(), Arc::new(standard)).is_some() {
                return Err(Error::Validation(format!("duplicate standard code {code}")));
            }
        }
        tracing::info!(count = by_code.len(), "standard registry loaded");
        Ok(Self { by_code })
    }

    /// Load every standard from the persistence collaborator.
    ///
    /// # Errors
    ///
    /// Propagates storage errors unchanged; duplicate codes are a validation error.
    pub async fn load<S: MeasurementStore>(store: &S) -> Result<Self> {
        let standards = store.load_standards().await?;
        Self::from_standards(standards)
    }

    /// Look up a standard by code.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the code is unknown.
    pub fn get(&self, code: &str) -> Result<Arc<Standard>> {
        self.by_code
            .get(code)
            .cloned()
            .ok_or_else(|| Error::standard_not_found(code))
    }

    /// All standards, optionally restricted to one test type, ordered by code.
    #[must_use]
    pub fn list(&self, test_type: Option<TestType>) -> Vec<Arc<Standard>> {
        let mut standards: Vec<Arc<Standard>> = self
            .by_code
            .values()
            .filter(|s| test_type.map_or(true, |t| s.test_type == t))
            .cloned()
            .collect();
        standards.sort_by(|a, b| a.code.cmp(&b.code));
        standards
    }

    /// Number of standards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_and_list() {
        let registry = StandardRegistry::from_standards([
            Standard::new("B", "b", TestType::Leakage),
            Standard::new("A", "a", TestType::Dielectric),
            Standard::new("C", "c", TestType::Dielectric),
        ])
        .unwrap();

        assert_eq!(registry.get("A").unwrap().name(), "a");
        let dielectric: Vec<String> = registry
            .list(Some(TestType::Dielectric))
            .iter()
            .map(|s| s.code().to_string())
            .collect();
        assert_eq!(dielectric, vec!["A", "C"]);
        assert_eq!(registry.list(None).len(), 3);
    }

    #[test]
    fn test_duration_parameters_are_bounded() {
        let standard = Standard::new("D", "d", TestType::Dielectric)
            .with_parameter("test_duration", 120)
            .with_parameter("ramp_down_timeout", 1e13)
            .with_parameter("hold", -1);
        assert_eq!(standard.duration_or("test_duration", 60.0).unwrap(), 120.0);
        assert_eq!(standard.duration_or("absent", 60.0).unwrap(), 60.0);
        let err = standard.duration_or("ramp_down_timeout", 30.0).unwrap_err();
        assert!(err.to_string().contains("at most"), "{err}");
        assert!(standard.duration_or("hold", 1.0).is_err());
    }

    #[test]
    fn test_unknown_code_is_not_found() {
        let registry = StandardRegistry::default();
        assert!(matches!(
            registry.get("nope"),
            Err(Error::NotFound { kind: "standard", .. })
        ));
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let result = StandardRegistry::from_standards([
            Standard::new("A", "a", TestType::Dielectric),
            Standard::new("A", "a2", TestType::Normal),
        ]);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_descriptive_string_parameter_is_absent() {
        let standard = Standard::new("A", "a", TestType::Dielectric)
            .with_parameter("test_voltage", "1000V DC + 2x rated voltage")
            .with_parameter("test_duration", "90");
        assert_eq!(standard.param_f64("test_voltage"), None);
        assert_eq!(standard.param_f64("test_duration"), Some(90.0));
        assert!((standard.non_negative_or("leakage_limit", 5.0).unwrap() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_negative_parameter_rejected() {
        let standard =
            Standard::new("A", "a", TestType::Dielectric).with_parameter("test_duration", -1);
        assert!(matches!(
            standard.non_negative_or("test_duration", 60.0),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_deserialize_from_store_row() {
        let standard: Standard = serde_json::from_value(json!({
            "code": "X-1",
            "name": "Example",
            "test_type": "leakage",
            "parameters": {"conditions": []},
            "pass_criteria": {"max_leakage_25C": 3.5}
        }))
        .unwrap();
        assert_eq!(standard.test_type(), TestType::Leakage);
        assert_eq!(standard.criterion_f64("max_leakage_25C"), Some(3.5));
    }
}
