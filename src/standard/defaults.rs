//! Built-in standards
//!
//! One standard per test type carrying the constants the test bench has
//! always used: IEC 60947-3 / UL 1741 dielectric withstand, the five-point
//! leakage sweep, normal-operation sub-checks and GB/T 37408 fault tests.
//! Deployments normally load their own definitions from the store; these
//! seed fresh stores and tests.

use serde_json::json;

use super::{Standard, TestType};

/// Code of the built-in dielectric withstand standard.
pub const DIELECTRIC: &str = "PVRSD-DW-IEC60947-3";
/// Code of the built-in leakage current standard.
pub const LEAKAGE: &str = "PVRSD-LC-IEC60947-3";
/// Code of the built-in normal-operation standard.
pub const NORMAL: &str = "PVRSD-NO-GBT37408";
/// Code of the built-in abnormal-operation standard.
pub const ABNORMAL: &str = "PVRSD-AO-GBT37408";

/// All built-in standards.
#[must_use]
pub fn builtin() -> Vec<Standard> {
    vec![dielectric(), leakage(), normal(), abnormal()]
}

/// Dielectric withstand: 1000 V DC + 2 × rated voltage for 60 s, leakage ≤ 5 mA.
#[must_use]
pub fn dielectric() -> Standard {
    Standard::new(DIELECTRIC, "Dielectric withstand (IEC 60947-3, UL 1741)", TestType::Dielectric)
        // descriptive, resolved from the device's rated voltage
        .with_parameter("test_voltage", "1000V DC + 2x rated voltage")
        .with_parameter("test_duration", 60)
        .with_parameter("leakage_limit", 5.0)
        .with_parameter("ramp_rate", 100.0)
        .with_criterion("max_leakage", 5.0)
        .with_criterion("breakdown", false)
}

/// Leakage current at 1.1 × rated voltage over five temperature/humidity points.
#[must_use]
pub fn leakage() -> Standard {
    Standard::new(LEAKAGE, "Leakage current (IEC 60947-3)", TestType::Leakage)
        .with_parameter("test_voltage", "1.1x rated voltage")
        .with_parameter(
            "conditions",
            json!([
                {"label": "25C", "temperature": 25.0, "humidity": 60.0, "duration": 30},
                {"label": "40C", "temperature": 40.0, "humidity": 60.0, "duration": 30},
                {"label": "60C", "temperature": 60.0, "humidity": 60.0, "duration": 30},
                {"label": "25C_93RH", "temperature": 25.0, "humidity": 93.0, "duration": 30},
                {"label": "40C_93RH", "temperature": 40.0, "humidity": 93.0, "duration": 30}
            ]),
        )
        .with_criterion("max_leakage_25C", 3.5)
        .with_criterion("max_leakage_60C", 5.0)
}

/// Normal operation: shutdown ≤ 30 s plus functional and performance checks.
#[must_use]
pub fn normal() -> Standard {
    Standard::new(NORMAL, "Normal operation (GB/T 37408)", TestType::Normal)
        .with_parameter("shutdown_time", 30)
        .with_parameter("performance_duration", 60)
        .with_criterion("max_time", 30)
        .with_criterion("success_rate", 95)
        .with_criterion("response_rate", 100)
        .with_criterion("stability", 95)
        .with_criterion("max_temp_rise", 40)
}

/// Abnormal operation: overload 1.1/1.5/2.0 ×, short circuit output/input/ground.
#[must_use]
pub fn abnormal() -> Standard {
    Standard::new(ABNORMAL, "Abnormal operation (GB/T 37408)", TestType::Abnormal)
        .with_parameter(
            "overload_levels",
            json!([
                {"factor": 1.1, "should_trip": false, "duration": 60},
                {"factor": 1.5, "should_trip": true, "duration": 30},
                {"factor": 2.0, "should_trip": true, "duration": 10}
            ]),
        )
        .with_parameter(
            "short_circuits",
            json!([
                {"location": "output", "response_time": 0.1},
                {"location": "input", "response_time": 0.05},
                {"location": "ground", "response_time": 0.2}
            ]),
        )
        .with_criterion("env_stress_passed", true)
}
