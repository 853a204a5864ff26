//! Thermal chamber contract.
//!
//! The chamber driver lives outside this crate. The engine only needs to
//! initialize it, command a set point and wait for stabilization, and bring
//! it back to a neutral state when the run ends.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Capability: temperature control of the chamber.
///
/// # Contract
/// - `initialize` is called once per run before the first set point
/// - `set_and_stabilize` returns once the chamber has settled (plus the soak
///   time, when given) or fails for that set point only
/// - `restore_neutral` ends a normally completed run
/// - `stop_control` switches the control loop off after an interrupted run
#[async_trait]
pub trait ThermalController: Send + Sync {
    /// Open the controller at `address` and prepare it for set points.
    async fn initialize(&self, address: &str) -> Result<()>;

    /// Command `celsius` and wait for the chamber to stabilize.
    ///
    /// `soak` overrides the controller's own soak time when set.
    async fn set_and_stabilize(&self, celsius: f64, soak: Option<Duration>) -> Result<()>;

    /// Return the chamber to its neutral (ambient) state.
    async fn restore_neutral(&self) -> Result<()>;

    /// Switch the active control loop off.
    async fn stop_control(&self) -> Result<()>;
}
