//! Evaluation engine: phase statistics × pass criteria → verdict
//!
//! Purely functional. For each criterion the engine locates the matching
//! statistic, infers the comparison from the criterion's declared type and
//! compares. Every failing criterion contributes a reason; a criterion with
//! no matching statistic fails and names the key it looked for.
//!
//! ## Statistic lookup
//!
//! 1. exact key (`max_leakage` → `max_leakage`)
//! 2. alias table for legacy criterion names (`max_time` → `response_time_s`)
//! 3. the key without its `min_`/`max_` prefix (`max_response_time_s` → `response_time_s`)
//! 4. condition tag: `max_leakage_25C` matches statistic `max_leakage` when
//!    statistic `condition` is `"25C"`
//!
//! ## Comparison inference
//!
//! | Criterion value               | Comparison            |
//! |-------------------------------|-----------------------|
//! | `true` / `false`              | statistic `==` flag   |
//! | number, key starts `min_`     | statistic `>=` value  |
//! | number, otherwise             | statistic `<=` value  |
//! | `{"op": "<", "value": 3}`     | explicit              |

mod criterion;

pub use criterion::{canonical_stat_key, Comparison, Criterion, Expected};

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Accumulated statistics of a test, keyed by statistic name.
pub type PhaseStats = BTreeMap<String, Value>;

/// Pass criteria, keyed by criterion name.
pub type Criteria = BTreeMap<String, Value>;

/// Statistic holding the condition tag used for tagged criterion lookup.
pub const CONDITION_KEY: &str = "condition";

/// Final pass/fail outcome with supporting reasons.
///
/// This is the only payload report and dashboard collaborators consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Overall outcome
    pub pass: bool,
    /// Why the test failed (empty on pass)
    pub reasons: Vec<String>,
}

impl Verdict {
    /// A passing verdict.
    #[must_use]
    pub const fn passed() -> Self {
        Self {
            pass: true,
            reasons: Vec::new(),
        }
    }

    /// A failing verdict with reasons.
    #[must_use]
    pub fn failed(reasons: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            pass: false,
            reasons: reasons.into_iter().map(Into::into).collect(),
        }
    }

    /// AND-combine two verdicts, keeping all reasons.
    #[must_use]
    pub fn and(mut self, other: Self) -> Self {
        self.pass &= other.pass;
        self.reasons.extend(other.reasons);
        self
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pass {
            f.write_str("PASS")
        } else {
            write!(f, "FAIL: {}", self.reasons.join("; "))
        }
    }
}

/// Evaluate `stats` against every criterion in `criteria`.
#[must_use]
pub fn evaluate(stats: &PhaseStats, criteria: &Criteria) -> Verdict {
    let mut reasons = Vec::new();
    for (key, declared) in criteria {
        let criterion = match Criterion::parse(key, declared) {
            Ok(criterion) => criterion,
            Err(reason) => {
                reasons.push(reason);
                continue;
            }
        };
        match locate(stats, key) {
            None => reasons.push(format!(
                "criterion {key}: required statistic {key} was not measured"
            )),
            Some((stat_key, measured)) => {
                if let Err(reason) = criterion.check(stat_key, measured) {
                    reasons.push(reason);
                }
            }
        }
    }
    if reasons.is_empty() {
        Verdict::passed()
    } else {
        tracing::debug!(failures = reasons.len(), "criteria failed");
        Verdict::failed(reasons)
    }
}

/// Default criteria overlaid by a standard's criteria.
///
/// A default is dropped when the standard declares a criterion that resolves
/// to the same statistic, so legacy-named criteria replace their canonical
/// counterparts instead of duplicating them.
#[must_use]
pub fn merge_criteria(defaults: Criteria, declared: &Criteria) -> Criteria {
    let covered: Vec<String> = declared.keys().map(|k| canonical_stat_key(k)).collect();
    let mut merged: Criteria = defaults
        .into_iter()
        .filter(|(k, _)| !covered.contains(&canonical_stat_key(k)))
        .collect();
    merged.extend(declared.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn locate<'a>(stats: &'a PhaseStats, key: &str) -> Option<(&'a str, &'a Value)> {
    let found = |k: &str| stats.get_key_value(k).map(|(k, v)| (k.as_str(), v));

    if let Some(hit) = found(key) {
        return Some(hit);
    }
    if let Some(alias) = criterion::alias(key) {
        if let Some(hit) = found(alias.stat) {
            return Some(hit);
        }
    }
    if let Some(rest) = key.strip_prefix("min_").or_else(|| key.strip_prefix("max_")) {
        if let Some(hit) = found(rest) {
            return Some(hit);
        }
    }
    let condition = stats.get(CONDITION_KEY).and_then(Value::as_str)?;
    key.rmatch_indices('_').find_map(|(i, _)| {
        let (base, tag) = (&key[..i], &key[i + 1..]);
        (tag == condition).then(|| found(base)).flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_all_criteria_met() {
        let stats = map(json!({"max_leakage": 4.2, "breakdown": false}));
        let criteria = map(json!({"max_leakage": 5.0, "breakdown": false}));
        assert_eq!(evaluate(&stats, &criteria), Verdict::passed());
    }

    #[test]
    fn test_missing_statistic_names_key() {
        let stats = map(json!({"max_leakage": 1.0}));
        let criteria = map(json!({"max_leakage": 5.0, "min_hold_duration_s": 60}));
        let verdict = evaluate(&stats, &criteria);
        assert!(!verdict.pass);
        assert_eq!(verdict.reasons.len(), 1);
        assert!(verdict.reasons[0].contains("min_hold_duration_s"));
    }

    #[test]
    fn test_all_failures_collected() {
        let stats = map(json!({"max_leakage": 9.0, "breakdown": true}));
        let criteria = map(json!({"max_leakage": 5.0, "breakdown": false, "other": 1}));
        let verdict = evaluate(&stats, &criteria);
        assert_eq!(verdict.reasons.len(), 3);
    }

    #[test]
    fn test_min_prefix_means_at_least() {
        let stats = map(json!({"hold_duration_s": 59.0}));
        let criteria = map(json!({"min_hold_duration_s": 60}));
        assert!(!evaluate(&stats, &criteria).pass);
    }

    #[test]
    fn test_legacy_alias_carries_operator() {
        let stats = map(json!({"communication_success_pct": 97.0, "response_time_s": 12.0}));
        let criteria = map(json!({"success_rate": 95, "max_time": 30}));
        assert!(evaluate(&stats, &criteria).pass);

        let stats = map(json!({"communication_success_pct": 90.0, "response_time_s": 12.0}));
        assert!(!evaluate(&stats, &criteria).pass);
    }

    #[test]
    fn test_condition_tag_alias() {
        let stats = map(json!({"max_leakage": 3.2, "condition": "25C"}));
        assert!(evaluate(&stats, &map(json!({"max_leakage_25C": 3.5}))).pass);
        assert!(!evaluate(&stats, &map(json!({"max_leakage_25C": 3.0}))).pass);
        // a different tag does not match
        let verdict = evaluate(&stats, &map(json!({"max_leakage_60C": 5.0})));
        assert!(verdict.reasons[0].contains("max_leakage_60C"));
    }

    #[test]
    fn test_explicit_operator() {
        let stats = map(json!({"trip_time_s": 0.1}));
        let criteria = map(json!({"trip_time_s": {"op": "<", "value": 0.1}}));
        assert!(!evaluate(&stats, &criteria).pass);
    }

    #[test]
    fn test_nan_statistic_fails() {
        let mut stats = PhaseStats::new();
        stats.insert("x".into(), Value::String("NaN".into()));
        assert!(!evaluate(&stats, &map(json!({"x": 1.0}))).pass);
    }

    #[test]
    fn test_merge_drops_covered_defaults() {
        let defaults = map(json!({"max_response_time_s": 30, "min_power_stability_pct": 95}));
        let declared = map(json!({"max_time": 20}));
        let merged = merge_criteria(defaults, &declared);
        assert_eq!(merged.len(), 2);
        assert!(merged.contains_key("max_time"));
        assert!(merged.contains_key("min_power_stability_pct"));
    }

    #[test]
    fn test_verdict_and() {
        let v = Verdict::passed().and(Verdict::failed(["a"])).and(Verdict::failed(["b"]));
        assert!(!v.pass);
        assert_eq!(v.reasons, vec!["a", "b"]);
        assert_eq!(v.to_string(), "FAIL: a; b");
    }
}
