//! # pvrsd-bench: compliance test engine for PV rapid-shutdown devices
//!
//! Drives dielectric withstand, leakage current, normal-operation and
//! abnormal-condition tests from a stream of electrical measurements,
//! evaluates the recorded statistics against a standard's pass criteria,
//! and compares measured traces with a simulated circuit.
//!
//! ## Components
//!
//! - [`adapter`]: heterogeneous rows (live frames, CSV/Parquet imports) to canonical [`sample::Sample`]s
//! - [`standard`]: immutable registry of test standards and their parameters
//! - [`machine`]: one state machine per experiment, enum-dispatched per test type
//! - [`evaluation`]: pure `stats × criteria → Verdict`
//! - [`simulation`]: synthetic traces and deviation metrics
//! - [`orchestrator`]: experiment lifecycle over a [`experiment::MeasurementStore`]
//!
//! ## Example
//!
//! ```rust
//! use pvrsd_bench::evaluation::{evaluate, Criteria, PhaseStats};
//! use serde_json::json;
//!
//! let stats: PhaseStats = serde_json::from_value(json!({"max_leakage": 3.1})).unwrap();
//! let criteria: Criteria = serde_json::from_value(json!({"max_leakage": 5.0})).unwrap();
//! assert!(evaluate(&stats, &criteria).pass);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod adapter;
pub mod clock;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod experiment;
pub mod logging;
pub mod machine;
pub mod orchestrator;
pub mod sample;
pub mod simulation;
pub mod standard;
pub mod stats;

pub use error::{Error, Result};
