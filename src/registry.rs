//! Device Registry for the instrument bench
//!
//! Holds the fixed catalog of twelve instrument slots, the results of the last
//! bus discovery, and the connectivity check that runs before measurements.
//!
//! # Slots
//!
//! | Slot | Count | Address |
//! |------|-------|---------|
//! | Power source | 4 | bus resource (`...INSTR`) |
//! | Oscilloscope | 1 | bus resource |
//! | Pulse generator | 1 | bus resource |
//! | DMM | 4 | bus resource |
//! | Thermal controller | 1 | bus resource |
//! | Relay controller | 1 | FTDI serial number |
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = DeviceRegistry::new();
//! registry.set_address(DeviceId::Osc, "USB0::0x0699::0x0401::C000001::INSTR");
//! registry.set_checked(DeviceId::Osc, true);
//!
//! let found = registry.discover(&buses).await;
//! println!("{}", found);
//!
//! let report = registry.connect_all(&validator, probe.as_ref()).await;
//! ```

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::{BusScanner, InstrumentProbe, Transport};
use crate::config::DeviceEntry;
use crate::device::{AddressRecord, DeviceId};
use crate::error::{MeasError, MeasResult};
use crate::outcome::Outcome;
use crate::validation::Validator;

/// One instrument slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSlot {
    pub id: DeviceId,
    pub checked: bool,
    pub address: String,
    pub name: String,
}

/// Resources found by the last discovery, per transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryLists {
    pub usb: Vec<String>,
    pub gpib: Vec<String>,
    pub ftdi: Vec<String>,
}

impl DiscoveryLists {
    /// Union of all transports, USB first.
    pub fn all(&self) -> Vec<String> {
        self.usb
            .iter()
            .chain(&self.gpib)
            .chain(&self.ftdi)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.usb.is_empty() && self.gpib.is_empty() && self.ftdi.is_empty()
    }
}

/// The three scanners used by discovery.
#[derive(Clone)]
pub struct BusSet {
    pub usb: Arc<dyn BusScanner>,
    pub gpib: Arc<dyn BusScanner>,
    pub ftdi: Arc<dyn BusScanner>,
}

/// Result of [`DeviceRegistry::connect_all`].
///
/// `responded` lists every device that answered, even when the overall
/// outcome failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectReport {
    pub outcome: Outcome<Vec<DeviceId>>,
    pub responded: Vec<DeviceId>,
}

/// Central catalog of the bench's instrument slots.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    slots: Vec<DeviceSlot>,
    discovered: DiscoveryLists,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// All twelve slots, unchecked, with default names and blank addresses.
    pub fn new() -> Self {
        Self {
            slots: DeviceId::ALL
                .into_iter()
                .map(|id| DeviceSlot {
                    id,
                    checked: false,
                    address: String::new(),
                    name: id.default_name().to_string(),
                })
                .collect(),
            discovered: DiscoveryLists::default(),
        }
    }

    /// Registry with slots filled from configuration entries.
    pub fn from_entries(entries: &[DeviceEntry]) -> MeasResult<Self> {
        let mut registry = Self::new();
        let mut seen = Vec::new();
        for entry in entries {
            let id = entry.id;
            if seen.contains(&id) {
                return Err(MeasError::Configuration(format!(
                    "Device {} is configured twice",
                    id
                )));
            }
            seen.push(id);
            let slot = registry.slot_mut(id);
            slot.checked = entry.checked;
            slot.address = entry.address.clone();
            if let Some(name) = &entry.name {
                slot.name = name.clone();
            }
        }
        Ok(registry)
    }

    fn slot_mut(&mut self, id: DeviceId) -> &mut DeviceSlot {
        // Slots are created for every id in `new`, in `DeviceId::ALL` order.
        let index = DeviceId::ALL
            .iter()
            .position(|candidate| *candidate == id)
            .unwrap_or_default();
        &mut self.slots[index]
    }

    pub fn slot(&self, id: DeviceId) -> Option<&DeviceSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slots(&self) -> &[DeviceSlot] {
        &self.slots
    }

    pub fn set_checked(&mut self, id: DeviceId, checked: bool) {
        self.slot_mut(id).checked = checked;
    }

    pub fn set_address(&mut self, id: DeviceId, address: impl Into<String>) {
        self.slot_mut(id).address = address.into();
    }

    pub fn set_name(&mut self, id: DeviceId, name: impl Into<String>) {
        self.slot_mut(id).name = name.into();
    }

    pub fn checked_ids(&self) -> Vec<DeviceId> {
        self.slots.iter().filter(|s| s.checked).map(|s| s.id).collect()
    }

    /// Immutable copy of every slot for use by a run.
    pub fn snapshot(&self) -> Vec<AddressRecord> {
        self.slots
            .iter()
            .map(|s| AddressRecord {
                checked: s.checked,
                address: s.address.clone(),
                name: s.name.clone(),
                id: s.id,
            })
            .collect()
    }

    pub fn discovered(&self) -> &DiscoveryLists {
        &self.discovered
    }

    /// Scan USB, GPIB and FTDI concurrently and refresh the discovery lists.
    ///
    /// A transport whose scan fails contributes an empty list.
    pub async fn discover(&mut self, buses: &BusSet) -> Outcome<Vec<String>> {
        let (usb, gpib, ftdi) = tokio::join!(
            scan_logged(buses.usb.as_ref()),
            scan_logged(buses.gpib.as_ref()),
            scan_logged(buses.ftdi.as_ref()),
        );
        self.discovered = DiscoveryLists { usb, gpib, ftdi };

        if self.discovered.is_empty() {
            warn!("Discovery found no device on any transport");
            return Outcome::fail("No device found on USB, GPIB or FTDI");
        }

        let message = format!(
            "Found {} USB, {} GPIB and {} FTDI device(s)",
            self.discovered.usb.len(),
            self.discovered.gpib.len(),
            self.discovered.ftdi.len()
        );
        info!("{}", message);
        Outcome::ok_with(self.discovered.all(), message)
    }

    /// Validate addresses, then probe every checked device in slot order.
    ///
    /// Succeeds only if every checked device responds. No I/O happens when
    /// nothing is checked or the addresses are invalid.
    pub async fn connect_all(
        &self,
        validator: &Validator,
        probe: &dyn InstrumentProbe,
    ) -> ConnectReport {
        let records: Vec<AddressRecord> = self.snapshot();
        let checked: Vec<&AddressRecord> = records.iter().filter(|r| r.checked).collect();

        if checked.is_empty() {
            return ConnectReport {
                outcome: Outcome::fail("No device selected"),
                responded: Vec::new(),
            };
        }

        let verdict = validator.validate_addresses(&records);
        if !verdict.ok {
            return ConnectReport {
                outcome: Outcome::fail(verdict.messages.join("\n")),
                responded: Vec::new(),
            };
        }

        let mut responded = Vec::new();
        let mut failures = Vec::new();
        for record in checked {
            let result = if record.id.is_relay() {
                probe.open_close_relay(&record.address).await.map(|()| None)
            } else {
                probe.identify(&record.address).await.map(Some)
            };

            match result {
                Ok(Some(idn)) if idn.trim().is_empty() => {
                    warn!(device = %record.id, "Empty identity response");
                    failures.push(format!("{} ({}): no response", record.name, record.id));
                }
                Ok(idn) => {
                    debug!(device = %record.id, idn = ?idn, "Device responded");
                    responded.push(record.id);
                }
                Err(e) => {
                    warn!(device = %record.id, error = %e, "Device did not respond");
                    failures.push(format!("{} ({}): {}", record.name, record.id, e));
                }
            }
        }

        let outcome = if failures.is_empty() {
            Outcome::ok_with(
                responded.clone(),
                format!("{} device(s) connected", responded.len()),
            )
        } else {
            Outcome::fail(failures.join("\n"))
        };
        ConnectReport { outcome, responded }
    }
}

async fn scan_logged(scanner: &dyn BusScanner) -> Vec<String> {
    let transport: Transport = scanner.transport();
    match scanner.scan().await {
        Ok(found) => {
            debug!(%transport, count = found.len(), "Scan complete");
            found
        }
        Err(e) => {
            warn!(%transport, error = %e, "Scan failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBus, MockProbe};

    fn buses(usb: &[&str], gpib: &[&str], ftdi: &[&str]) -> BusSet {
        BusSet {
            usb: Arc::new(MockBus::new(Transport::Usb, usb)),
            gpib: Arc::new(MockBus::new(Transport::Gpib, gpib)),
            ftdi: Arc::new(MockBus::new(Transport::Ftdi, ftdi)),
        }
    }

    #[test]
    fn new_registry_has_twelve_unchecked_slots() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.slots().len(), 12);
        assert!(registry.checked_ids().is_empty());
        assert_eq!(registry.slot(DeviceId::Relay).unwrap().name, "Relay Board");
    }

    #[test]
    fn snapshot_carries_renamed_slots() {
        let mut registry = DeviceRegistry::new();
        registry.set_name(DeviceId::Dmm2, "Load DMM");
        registry.set_checked(DeviceId::Dmm2, true);
        registry.set_address(DeviceId::Dmm2, "GPIB0::23::INSTR");

        let record = registry
            .snapshot()
            .into_iter()
            .find(|r| r.id == DeviceId::Dmm2)
            .unwrap();
        assert_eq!(record.name, "Load DMM");
        assert!(record.checked);
        assert_eq!(registry.checked_ids(), vec![DeviceId::Dmm2]);
    }

    #[tokio::test]
    async fn discover_unions_transports() {
        let mut registry = DeviceRegistry::new();
        let out = registry
            .discover(&buses(&["USB0::1::INSTR"], &["GPIB0::5::INSTR"], &["FT01"]))
            .await;
        assert!(out.is_ok());
        assert_eq!(out.payload().unwrap().len(), 3);
        assert_eq!(registry.discovered().usb, ["USB0::1::INSTR".to_string()]);
        assert_eq!(registry.discovered().ftdi, ["FT01".to_string()]);
    }

    #[tokio::test]
    async fn discover_fails_when_nothing_found() {
        let mut registry = DeviceRegistry::new();
        let failing = BusSet {
            usb: Arc::new(MockBus::failing(Transport::Usb)),
            ..buses(&[], &[], &[])
        };
        let out = registry.discover(&failing).await;
        assert!(!out.is_ok());
        assert!(registry.discovered().is_empty());
    }

    #[tokio::test]
    async fn connect_all_without_selection_does_no_io() {
        let registry = DeviceRegistry::new();
        let probe = MockProbe::new();
        let report = registry.connect_all(&Validator::new(), &probe).await;
        assert!(!report.outcome.is_ok());
        assert_eq!(report.outcome.message(), "No device selected");
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn connect_all_invalid_address_does_no_io() {
        let mut registry = DeviceRegistry::new();
        registry.set_checked(DeviceId::Osc, true);
        registry.set_address(DeviceId::Osc, "USB0::1");
        let probe = MockProbe::new();
        let report = registry.connect_all(&Validator::new(), &probe).await;
        assert!(!report.outcome.is_ok());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn connect_all_reports_partial_success() {
        let mut registry = DeviceRegistry::new();
        registry.set_checked(DeviceId::Osc, true);
        registry.set_address(DeviceId::Osc, "USB0::1::INSTR");
        registry.set_checked(DeviceId::Dmm1, true);
        registry.set_address(DeviceId::Dmm1, "GPIB0::22::INSTR");
        registry.set_checked(DeviceId::Relay, true);
        registry.set_address(DeviceId::Relay, "FT01");

        let probe = MockProbe::new().unresponsive("GPIB0::22::INSTR");
        let report = registry.connect_all(&Validator::new(), &probe).await;

        assert!(!report.outcome.is_ok());
        assert!(report.outcome.payload().is_none());
        assert_eq!(report.responded, vec![DeviceId::Osc, DeviceId::Relay]);
        assert!(report.outcome.message().contains("DMM1"));
        assert_eq!(probe.relay_calls(), 1);
    }
}
