//! Relay multiplexer for switching between physical samples.
//!
//! The relay board exposes six output pins; logical relay `N` (1-based) is
//! pin `N - 1`. Every operation opens its own transport session and closes it
//! before returning; sessions are never held across calls.
//!
//! # Sample loop
//!
//! ```text
//! for port in 1..=count
//!     cancel? ──yes──> Cancelled
//!     relay_on(port) ──fail──> annotate, next port
//!     step(port)
//!     relay_off(port)   (best effort)
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::error::{MeasError, MeasResult};
use crate::outcome::Outcome;
use crate::rowlog::RowLog;

/// Number of addressable relay pins.
pub const RELAY_PIN_COUNT: u8 = 6;

/// Mask with every relay off.
pub const ALL_OFF: u8 = 0;

/// Capability: open a session on the relay controller.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a session on the controller with the given serial number.
    async fn open(&self, serial: &str) -> Result<Box<dyn RelaySession>>;
}

/// An open session on the relay controller.
#[async_trait]
pub trait RelaySession: Send {
    /// Drive all pins at once; bit `n` is pin `n`.
    async fn write_pins(&mut self, mask: u8) -> Result<()>;

    /// Release the session.
    async fn close(&mut self) -> Result<()>;
}

/// Map a 1-based relay number to its pin.
pub fn pin_for(relay: u8) -> Result<u8> {
    if (1..=RELAY_PIN_COUNT).contains(&relay) {
        Ok(relay - 1)
    } else {
        Err(anyhow!(
            "Relay {} is out of range 1..={}",
            relay,
            RELAY_PIN_COUNT
        ))
    }
}

/// How the per-sample step is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// One unswitched pass.
    Single,
    /// Switch through samples `1..=count`.
    Multi { count: u8 },
}

/// Work executed while one sample is switched in.
#[async_trait]
pub trait SampleStep: Send {
    /// `sample` is `None` in single-sample mode.
    async fn run_sample(&mut self, sample: Option<u8>, log: &mut RowLog) -> MeasResult<()>;
}

/// Drives the relay bank of one controller.
#[derive(Clone)]
pub struct RelayMultiplexer {
    transport: Arc<dyn RelayTransport>,
    serial: String,
}

impl RelayMultiplexer {
    pub fn new(transport: Arc<dyn RelayTransport>, serial: impl Into<String>) -> Self {
        Self {
            transport,
            serial: serial.into(),
        }
    }

    /// Open a session, write the masks in order, close the session.
    ///
    /// The session is closed even if a write fails; the first error wins.
    async fn write_masks(&self, masks: &[u8]) -> Result<()> {
        let mut session = self.transport.open(&self.serial).await?;
        let mut result = Ok(());
        for &mask in masks {
            debug!(serial = %self.serial, mask, "Writing relay pins");
            if let Err(e) = session.write_pins(mask).await {
                result = Err(e);
                break;
            }
        }
        let closed = session.close().await;
        result.and(closed)
    }

    /// Turn exactly one relay on; all others are explicitly switched off first.
    pub async fn set_exclusive(&self, relay: u8) -> Outcome {
        let pin = match pin_for(relay) {
            Ok(pin) => pin,
            Err(e) => return Outcome::fail(e.to_string()),
        };
        match self.write_masks(&[ALL_OFF, 1 << pin]).await {
            Ok(()) => {
                info!(relay, "Relay switched on exclusively");
                Outcome::ok(format!("Relay {} on", relay))
            }
            Err(e) => Outcome::fail(format!("Relay {}: {}", relay, e)),
        }
    }

    /// Turn every relay off.
    pub async fn all_off(&self) -> Outcome {
        match self.write_masks(&[ALL_OFF]).await {
            Ok(()) => Outcome::ok("All relays off"),
            Err(e) => Outcome::fail(format!("All relays off: {}", e)),
        }
    }

    pub async fn relay_on(&self, relay: u8) -> Result<()> {
        let pin = pin_for(relay)?;
        self.write_masks(&[1 << pin]).await
    }

    pub async fn relay_off(&self, relay: u8) -> Result<()> {
        pin_for(relay)?;
        self.write_masks(&[ALL_OFF]).await
    }

    /// Run `step` once per sample, switching relays in between.
    ///
    /// A relay that fails to switch on is annotated and skipped (fatal when
    /// `stop_on_warning` is set). Switching off afterwards is best effort.
    pub async fn run_samples(
        &self,
        mode: SampleMode,
        cancel: &CancelFlag,
        log: &mut RowLog,
        step: &mut dyn SampleStep,
        stop_on_warning: bool,
    ) -> MeasResult<()> {
        let count = match mode {
            SampleMode::Single => {
                cancel.check()?;
                return step.run_sample(None, log).await;
            }
            SampleMode::Multi { count } => count,
        };

        for port in 1..=count {
            cancel.check()?;

            if let Err(e) = self.relay_on(port).await {
                let message = format!("Sample {}: relay on failed: {}", port, e);
                warn!(sample = port, error = %e, "Relay on failed, skipping sample");
                log.annotate(message.clone());
                if stop_on_warning {
                    return Err(MeasError::fatal(message));
                }
                continue;
            }

            debug!(sample = port, "Sample switched in");
            let result = step.run_sample(Some(port), log).await;

            if let Err(e) = self.relay_off(port).await {
                warn!(sample = port, error = %e, "Relay off failed");
            }
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRelayTransport;
    use tracing_test::traced_test;

    struct Recorder {
        samples: Vec<Option<u8>>,
    }

    #[async_trait]
    impl SampleStep for Recorder {
        async fn run_sample(&mut self, sample: Option<u8>, log: &mut RowLog) -> MeasResult<()> {
            self.samples.push(sample);
            log.push_data(format!("sample,{:?}", sample));
            Ok(())
        }
    }

    #[test]
    fn relay_maps_to_pin_minus_one() {
        assert_eq!(pin_for(1).unwrap(), 0);
        assert_eq!(pin_for(6).unwrap(), 5);
        assert!(pin_for(0).is_err());
        assert!(pin_for(7).is_err());
    }

    #[tokio::test]
    async fn exclusive_writes_all_off_first() {
        let transport = Arc::new(MockRelayTransport::new());
        let mux = RelayMultiplexer::new(transport.clone(), "FT01");

        let out = mux.set_exclusive(3).await;
        assert!(out.is_ok());
        assert_eq!(transport.writes(), vec![0b000000, 0b000100]);
        assert_eq!(transport.open_sessions(), 0);
        assert_eq!(transport.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn exclusive_rejects_out_of_range_without_io() {
        let transport = Arc::new(MockRelayTransport::new());
        let mux = RelayMultiplexer::new(transport.clone(), "FT01");

        assert!(!mux.set_exclusive(9).await.is_ok());
        assert_eq!(transport.sessions_opened(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_relay_skips_sample_and_annotates() {
        let transport = Arc::new(MockRelayTransport::new().fail_on_relay(2));
        let mux = RelayMultiplexer::new(transport.clone(), "FT01");
        let mut step = Recorder { samples: vec![] };
        let mut log = RowLog::new();

        mux.run_samples(
            SampleMode::Multi { count: 3 },
            &CancelFlag::new(),
            &mut log,
            &mut step,
            false,
        )
        .await
        .unwrap();

        assert_eq!(step.samples, vec![Some(1), Some(3)]);
        assert!(log.annotations().iter().any(|a| a.contains("Sample 2")));
        assert_eq!(transport.open_sessions(), 0);
        assert!(logs_contain("Relay on failed, skipping sample"));
    }

    #[tokio::test]
    async fn stop_on_warning_escalates_relay_failure() {
        let transport = Arc::new(MockRelayTransport::new().fail_on_relay(1));
        let mux = RelayMultiplexer::new(transport, "FT01");
        let mut step = Recorder { samples: vec![] };
        let mut log = RowLog::new();

        let err = mux
            .run_samples(
                SampleMode::Multi { count: 2 },
                &CancelFlag::new(),
                &mut log,
                &mut step,
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeasError::Fatal(_)));
        assert!(step.samples.is_empty());
    }

    #[tokio::test]
    async fn single_mode_runs_once_without_switching() {
        let transport = Arc::new(MockRelayTransport::new());
        let mux = RelayMultiplexer::new(transport.clone(), "");
        let mut step = Recorder { samples: vec![] };
        let mut log = RowLog::new();

        mux.run_samples(SampleMode::Single, &CancelFlag::new(), &mut log, &mut step, false)
            .await
            .unwrap();

        assert_eq!(step.samples, vec![None]);
        assert_eq!(transport.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn cancelled_loop_runs_nothing() {
        let transport = Arc::new(MockRelayTransport::new());
        let mux = RelayMultiplexer::new(transport.clone(), "FT01");
        let mut step = Recorder { samples: vec![] };
        let mut log = RowLog::new();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = mux
            .run_samples(SampleMode::Multi { count: 3 }, &cancel, &mut log, &mut step, false)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(step.samples.is_empty());
        assert_eq!(transport.sessions_opened(), 0);
    }
}
