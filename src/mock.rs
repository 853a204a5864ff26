//! Simulated collaborators
//!
//! Stand-ins for every hardware-facing seam of the engine, used by the test
//! suite and by `tempchar --simulate`. All waiting uses `tokio::time::sleep`.
//!
//! # Available Mocks
//!
//! - `MockBus` - fixed discovery result per transport, or a failing scan
//! - `MockProbe` - answers `*IDN?` except for configured addresses
//! - `MockRelayTransport` - records pin writes and session balance
//! - `MockThermal` - records set points, configurable settle time and failures
//! - `MockExecutor` - emits deterministic readings per tab
//! - `MockDialog` - fixed confirmation answer, records everything shown

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use crate::bus::{BusScanner, InstrumentProbe, Transport};
use crate::dialog::Dialog;
use crate::error::{MeasError, MeasResult};
use crate::executor::{CategoryExecutor, DataRecord, ExecutionContext};
use crate::relay::{RelaySession, RelayTransport};
use crate::rowlog::RowLog;
use crate::settings::Category;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// MockBus
// =============================================================================

/// Scanner returning a fixed resource list.
pub struct MockBus {
    transport: Transport,
    resources: Option<Vec<String>>,
}

impl MockBus {
    pub fn new(transport: Transport, resources: &[&str]) -> Self {
        Self {
            transport,
            resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        }
    }

    /// Scanner whose every scan errors.
    pub fn failing(transport: Transport) -> Self {
        Self {
            transport,
            resources: None,
        }
    }
}

#[async_trait]
impl BusScanner for MockBus {
    fn transport(&self) -> Transport {
        self.transport
    }

    async fn scan(&self) -> Result<Vec<String>> {
        sleep(Duration::from_millis(5)).await;
        self.resources
            .clone()
            .ok_or_else(|| anyhow!("{} driver not available", self.transport))
    }
}

// =============================================================================
// MockProbe
// =============================================================================

/// Probe where every address answers unless marked unresponsive.
#[derive(Default)]
pub struct MockProbe {
    unresponsive: Vec<String>,
    calls: AtomicUsize,
    relay_calls: AtomicUsize,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `address` time out.
    pub fn unresponsive(mut self, address: &str) -> Self {
        self.unresponsive.push(address.to_string());
        self
    }

    /// Total probe calls, bus and relay.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn relay_calls(&self) -> usize {
        self.relay_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstrumentProbe for MockProbe {
    async fn identify(&self, address: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(2)).await;
        if self.unresponsive.iter().any(|a| a == address) {
            bail!("Timeout waiting for {}", address);
        }
        Ok(format!("MOCK,Instrument,{},1.0", address))
    }

    async fn open_close_relay(&self, serial: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.relay_calls.fetch_add(1, Ordering::SeqCst);
        if self.unresponsive.iter().any(|s| s == serial) {
            bail!("Relay controller {} not found", serial);
        }
        Ok(())
    }
}

// =============================================================================
// MockRelayTransport
// =============================================================================

#[derive(Default)]
struct RelayState {
    writes: Vec<u8>,
    open: usize,
    opened: usize,
}

/// Relay controller that records every successful pin write.
#[derive(Default)]
pub struct MockRelayTransport {
    state: Arc<Mutex<RelayState>>,
    fail_mask: u8,
}

impl MockRelayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write that would switch `relay` on.
    pub fn fail_on_relay(mut self, relay: u8) -> Self {
        if let Some(pin) = relay.checked_sub(1) {
            self.fail_mask |= 1 << pin;
        }
        self
    }

    /// Successful pin masks in write order.
    pub fn writes(&self) -> Vec<u8> {
        locked(&self.state).writes.clone()
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        locked(&self.state).open
    }

    /// Sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        locked(&self.state).opened
    }
}

#[async_trait]
impl RelayTransport for MockRelayTransport {
    async fn open(&self, serial: &str) -> Result<Box<dyn RelaySession>> {
        if serial.trim().is_empty() {
            bail!("Relay controller serial is blank");
        }
        let mut state = locked(&self.state);
        state.open += 1;
        state.opened += 1;
        Ok(Box::new(MockRelaySession {
            state: self.state.clone(),
            fail_mask: self.fail_mask,
            closed: false,
        }))
    }
}

struct MockRelaySession {
    state: Arc<Mutex<RelayState>>,
    fail_mask: u8,
    closed: bool,
}

#[async_trait]
impl RelaySession for MockRelaySession {
    async fn write_pins(&mut self, mask: u8) -> Result<()> {
        if mask & self.fail_mask != 0 {
            bail!("Pin write 0b{:06b} failed", mask);
        }
        locked(&self.state).writes.push(mask);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            locked(&self.state).open -= 1;
        }
        Ok(())
    }
}

// =============================================================================
// MockThermal
// =============================================================================

/// Chamber that settles after a fixed delay.
pub struct MockThermal {
    settle: Duration,
    fail_init: bool,
    failing: Vec<f64>,
    set_points: Mutex<Vec<f64>>,
    initialized: AtomicUsize,
    restores: AtomicUsize,
    stops: AtomicUsize,
}

impl Default for MockThermal {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(10),
            fail_init: false,
            failing: Vec::new(),
            set_points: Mutex::new(Vec::new()),
            initialized: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }
}

impl MockThermal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time `set_and_stabilize` takes when no soak override is given.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Fail stabilization at `celsius`.
    pub fn failing_at(mut self, celsius: f64) -> Self {
        self.failing.push(celsius);
        self
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Set points commanded so far, including failed ones.
    pub fn set_points(&self) -> Vec<f64> {
        locked(&self.set_points).clone()
    }

    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::thermal::ThermalController for MockThermal {
    async fn initialize(&self, address: &str) -> Result<()> {
        if self.fail_init {
            bail!("Chamber at '{}' does not respond", address);
        }
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_and_stabilize(&self, celsius: f64, soak: Option<Duration>) -> Result<()> {
        locked(&self.set_points).push(celsius);
        sleep(soak.unwrap_or(self.settle)).await;
        if self.failing.contains(&celsius) {
            bail!("Chamber did not stabilize at {}°C", celsius);
        }
        Ok(())
    }

    async fn restore_neutral(&self) -> Result<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_control(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockExecutor
// =============================================================================

/// Executor emitting one reading per configured item for every enabled tab.
///
/// Values drift with temperature and sample so pivoted reports are easy to
/// read: `base + 0.001 * temperature + 0.01 * sample`.
pub struct MockExecutor {
    category: Category,
    readings: Vec<(String, f64, String)>,
    delay: Duration,
    warn_on_sample: Option<u8>,
    fatal_on_sample: Option<u8>,
    calls: Mutex<Vec<(Option<f64>, Option<u8>)>>,
}

impl MockExecutor {
    pub fn new(category: Category) -> Self {
        let reading = match category {
            Category::Sweep => ("Vout", 3.3, "V"),
            Category::Delay => ("tpd", 1.2e-8, "s"),
            Category::Vi => ("Iout", 0.25, "A"),
        };
        Self {
            category,
            readings: vec![(reading.0.to_string(), reading.1, reading.2.to_string())],
            delay: Duration::ZERO,
            warn_on_sample: None,
            fatal_on_sample: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Add another reading per tab.
    pub fn with_reading(mut self, item: &str, base: f64, unit: &str) -> Self {
        self.readings
            .push((item.to_string(), base, unit.to_string()));
        self
    }

    /// Simulated measurement time per invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Return a warning instead of measuring on `sample`.
    pub fn warn_on_sample(mut self, sample: u8) -> Self {
        self.warn_on_sample = Some(sample);
        self
    }

    /// Return a fatal error instead of measuring on `sample`.
    pub fn fatal_on_sample(mut self, sample: u8) -> Self {
        self.fatal_on_sample = Some(sample);
        self
    }

    /// (temperature, sample) of every invocation.
    pub fn calls(&self) -> Vec<(Option<f64>, Option<u8>)> {
        locked(&self.calls).clone()
    }
}

#[async_trait]
impl CategoryExecutor for MockExecutor {
    fn category(&self) -> Category {
        self.category
    }

    async fn execute(&self, ctx: &ExecutionContext<'_>, log: &mut RowLog) -> MeasResult<()> {
        locked(&self.calls).push((ctx.temperature, ctx.sample));
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if ctx.sample.is_some() && ctx.sample == self.fatal_on_sample {
            return Err(MeasError::fatal(format!(
                "{}: instrument lost during sample {:?}",
                self.category, ctx.sample
            )));
        }
        if ctx.sample.is_some() && ctx.sample == self.warn_on_sample {
            return Err(MeasError::warning(format!(
                "{}: no data for sample {:?}",
                self.category, ctx.sample
            )));
        }

        let drift = 0.001 * ctx.temperature.unwrap_or(0.0)
            + 0.01 * f64::from(ctx.sample.unwrap_or(0));
        for tab in &ctx.binding.tabs {
            for (item, base, unit) in &self.readings {
                let record = DataRecord {
                    temperature: ctx.temperature,
                    sample: ctx.sample,
                    tab: tab.name.clone(),
                    item: item.clone(),
                    value: base + drift,
                    unit: unit.clone(),
                };
                log.push_data(record.to_row()?);
            }
        }
        Ok(())
    }
}

// =============================================================================
// MockDialog
// =============================================================================

/// Dialog with a fixed confirmation answer that records what it was shown.
pub struct MockDialog {
    answer: bool,
    confirmations: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl MockDialog {
    /// Dialog answering yes.
    pub fn new() -> Self {
        Self {
            answer: true,
            confirmations: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Dialog answering no.
    pub fn declining() -> Self {
        Self {
            answer: false,
            ..Self::new()
        }
    }

    /// Bodies of the confirmation requests.
    pub fn confirmations(&self) -> Vec<String> {
        locked(&self.confirmations).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        locked(&self.messages).clone()
    }

    pub fn errors(&self) -> Vec<String> {
        locked(&self.errors).clone()
    }

    /// Number of completion notices shown (messages and errors).
    pub fn shown(&self) -> usize {
        locked(&self.messages).len() + locked(&self.errors).len()
    }
}

impl Default for MockDialog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialog for MockDialog {
    async fn confirm(&self, _title: &str, message: &str) -> bool {
        locked(&self.confirmations).push(message.to_string());
        self.answer
    }

    fn show_message(&self, _title: &str, message: &str) {
        locked(&self.messages).push(message.to_string());
    }

    fn show_error(&self, _title: &str, message: &str) {
        locked(&self.errors).push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thermal::ThermalController;

    #[tokio::test]
    async fn relay_session_balance_is_tracked() {
        let transport = MockRelayTransport::new().fail_on_relay(1);
        let mut session = transport.open("FT01").await.unwrap();
        assert_eq!(transport.open_sessions(), 1);
        assert!(session.write_pins(0b000001).await.is_err());
        session.write_pins(0b000010).await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert_eq!(transport.writes(), vec![0b000010]);
        assert_eq!(transport.open_sessions(), 0);
        assert!(transport.open("  ").await.is_err());
    }

    #[tokio::test]
    async fn thermal_records_failed_set_points() {
        let thermal = MockThermal::new()
            .with_settle(Duration::from_millis(1))
            .failing_at(85.0);
        thermal.initialize("GPIB0::1::INSTR").await.unwrap();
        thermal.set_and_stabilize(25.0, None).await.unwrap();
        assert!(thermal.set_and_stabilize(85.0, None).await.is_err());
        assert_eq!(thermal.set_points(), vec![25.0, 85.0]);
        assert_eq!(thermal.initialized(), 1);
    }

    #[tokio::test]
    async fn failing_bus_reports_error() {
        assert!(MockBus::failing(Transport::Gpib).scan().await.is_err());
        let found = MockBus::new(Transport::Usb, &["USB0::1::INSTR"]).scan().await.unwrap();
        assert_eq!(found, vec!["USB0::1::INSTR".to_string()]);
    }
}
