//! Experiment records and the persistence contract
//!
//! ## Schema Overview
//!
//! ```text
//! Standard (1) ──< Experiment (N)
//!                      │
//!                      ├──< Sample (N) [time-series]
//!                      └──< SimulationSummary (N)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use pvrsd_bench::experiment::{MeasurementStore, MemoryStore, NewExperiment};
//! use pvrsd_bench::standard::TestType;
//!
//! # async fn example() -> pvrsd_bench::Result<()> {
//! let store = MemoryStore::new();
//! let id = store
//!     .create_experiment(NewExperiment::builder(TestType::Dielectric, "dev-7", "STD-1").build())
//!     .await?;
//! assert!(store.get_experiment(&id).await?.is_some());
//! # Ok(())
//! # }
//! ```

mod record;
mod store;

pub use record::{
    Experiment, ExperimentId, ExperimentStatus, NewExperiment, NewExperimentBuilder,
    TerminalUpdate, TestResult,
};
pub use store::{MeasurementStore, MemoryStore};
