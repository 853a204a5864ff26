//! # tempchar
//!
//! Orchestration core for temperature-characteristic measurement of
//! electronic devices under test. The crate validates instrument addresses and
//! tab settings before any hardware is touched, sequences chamber set points,
//! sample relays and the Sweep/Delay/VI category executors, handles
//! cancellation and partial failures, and aggregates the results into a CSV
//! report.
//!
//! ## Crate Structure
//!
//! - **`engine`**: `MeasurementEngine`, the run state machine and pipeline.
//! - **`registry`**: the twelve device slots, bus discovery and connectivity probing.
//! - **`validation`**: address, numeric, category and auto-range rules.
//! - **`relay`**: the sample relay multiplexer and its transport contract.
//! - **`thermal`**, **`executor`**, **`dialog`**, **`report`**: collaborator
//!   contracts plus the default aggregator and report writer.
//! - **`bus`**: bus scanner and probe contracts, with serialport/VISA back-ends.
//! - **`device`**, **`settings`**, **`rowlog`**, **`outcome`**: data model.
//! - **`config`**, **`logging`**, **`error`**: configuration, tracing setup
//!   and the `MeasError` type.
//! - **`mock`**: simulated collaborators for tests and `--simulate`.

pub mod bus;
pub mod cancel;
pub mod config;
pub mod device;
pub mod dialog;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod mock;
pub mod outcome;
pub mod registry;
pub mod relay;
pub mod report;
pub mod rowlog;
pub mod settings;
pub mod thermal;
pub mod validation;

pub use device::DeviceId;
pub use engine::{MeasurementEngine, RunOutcome, RunReport};
pub use error::{MeasError, MeasResult, Severity};
pub use outcome::Outcome;
