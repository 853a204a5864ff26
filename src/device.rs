//! Instrument slots and the per-run device model.
//!
//! The bench has a fixed set of twelve instrument slots. Each run snapshots the
//! slots into [`AddressRecord`]s and, for every enabled measurement category,
//! combines them with the tab settings into [`Device`]s.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{MeasError, MeasResult};
use crate::settings::SettingsPayload;

/// Marker every bus resource address must contain.
pub const RESOURCE_MARKER: &str = "INSTR";

/// Stable identifier of an instrument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceId {
    Source1,
    Source2,
    Source3,
    Source4,
    Osc,
    Pulse,
    Dmm1,
    Dmm2,
    Dmm3,
    Dmm4,
    Thermo,
    Relay,
}

impl DeviceId {
    /// Every slot, in registry order.
    pub const ALL: [DeviceId; 12] = [
        DeviceId::Source1,
        DeviceId::Source2,
        DeviceId::Source3,
        DeviceId::Source4,
        DeviceId::Osc,
        DeviceId::Pulse,
        DeviceId::Dmm1,
        DeviceId::Dmm2,
        DeviceId::Dmm3,
        DeviceId::Dmm4,
        DeviceId::Thermo,
        DeviceId::Relay,
    ];

    /// Stable tag used in config files, logs and report footers.
    pub fn tag(&self) -> &'static str {
        match self {
            DeviceId::Source1 => "SOURCE1",
            DeviceId::Source2 => "SOURCE2",
            DeviceId::Source3 => "SOURCE3",
            DeviceId::Source4 => "SOURCE4",
            DeviceId::Osc => "OSC",
            DeviceId::Pulse => "PULSE",
            DeviceId::Dmm1 => "DMM1",
            DeviceId::Dmm2 => "DMM2",
            DeviceId::Dmm3 => "DMM3",
            DeviceId::Dmm4 => "DMM4",
            DeviceId::Thermo => "THERMO",
            DeviceId::Relay => "RELAY",
        }
    }

    /// Default display name for the slot.
    pub fn default_name(&self) -> &'static str {
        match self {
            DeviceId::Source1 => "Power Source 1",
            DeviceId::Source2 => "Power Source 2",
            DeviceId::Source3 => "Power Source 3",
            DeviceId::Source4 => "Power Source 4",
            DeviceId::Osc => "Oscilloscope",
            DeviceId::Pulse => "Pulse Generator",
            DeviceId::Dmm1 => "DMM 1",
            DeviceId::Dmm2 => "DMM 2",
            DeviceId::Dmm3 => "DMM 3",
            DeviceId::Dmm4 => "DMM 4",
            DeviceId::Thermo => "Thermal Chamber",
            DeviceId::Relay => "Relay Board",
        }
    }

    /// The relay controller is addressed by a transport serial number rather
    /// than a bus resource string.
    pub fn is_relay(&self) -> bool {
        matches!(self, DeviceId::Relay)
    }

    pub fn is_source(&self) -> bool {
        matches!(
            self,
            DeviceId::Source1 | DeviceId::Source2 | DeviceId::Source3 | DeviceId::Source4
        )
    }

    pub fn is_dmm(&self) -> bool {
        matches!(
            self,
            DeviceId::Dmm1 | DeviceId::Dmm2 | DeviceId::Dmm3 | DeviceId::Dmm4
        )
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for DeviceId {
    type Err = MeasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        DeviceId::ALL
            .into_iter()
            .find(|id| id.tag() == upper)
            .ok_or_else(|| MeasError::Configuration(format!("Unknown device identifier '{}'", s)))
    }
}

/// Snapshot of one slot taken at run start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub checked: bool,
    pub address: String,
    pub name: String,
    pub id: DeviceId,
}

impl AddressRecord {
    pub fn new(id: DeviceId, checked: bool, address: impl Into<String>) -> Self {
        Self {
            checked,
            address: address.into(),
            name: id.default_name().to_string(),
            id,
        }
    }
}

/// A device bound to the tab settings that use it, for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub address: String,
    pub name: String,
    settings: Vec<(String, SettingsPayload)>,
}

impl Device {
    pub fn new(id: DeviceId, address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            name: name.into(),
            settings: Vec::new(),
        }
    }

    pub fn from_record(record: &AddressRecord) -> Self {
        Self::new(record.id, record.address.clone(), record.name.clone())
    }

    /// Attach the settings of a tab. Tab names are unique per device.
    pub fn insert_setting(
        &mut self,
        tab: impl Into<String>,
        payload: SettingsPayload,
    ) -> MeasResult<()> {
        let tab = tab.into();
        if self.settings.iter().any(|(name, _)| *name == tab) {
            return Err(MeasError::warning(format!(
                "{}: settings for tab '{}' registered twice",
                self.id, tab
            )));
        }
        self.settings.push((tab, payload));
        Ok(())
    }

    pub fn setting(&self, tab: &str) -> Option<&SettingsPayload> {
        self.settings
            .iter()
            .find(|(name, _)| name == tab)
            .map(|(_, payload)| payload)
    }

    /// Settings in insertion order.
    pub fn settings(&self) -> impl Iterator<Item = (&str, &SettingsPayload)> {
        self.settings.iter().map(|(name, p)| (name.as_str(), p))
    }

    pub fn settings_len(&self) -> usize {
        self.settings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ViSettings;

    #[test]
    fn tags_round_trip() {
        for id in DeviceId::ALL {
            assert_eq!(id.tag().parse::<DeviceId>().ok(), Some(id));
        }
        assert!("SCOPE".parse::<DeviceId>().is_err());
        assert_eq!("dmm3".parse::<DeviceId>().ok(), Some(DeviceId::Dmm3));
    }

    #[test]
    fn only_relay_is_relay_class() {
        let relays: Vec<_> = DeviceId::ALL.iter().filter(|id| id.is_relay()).collect();
        assert_eq!(relays, vec![&DeviceId::Relay]);
    }

    #[test]
    fn settings_keep_insertion_order_and_reject_duplicates() {
        let mut dev = Device::new(DeviceId::Dmm1, "GPIB0::22::INSTR", "DMM 1");
        dev.insert_setting("zeta", SettingsPayload::Vi(ViSettings::default()))
            .unwrap();
        dev.insert_setting("alpha", SettingsPayload::Vi(ViSettings::default()))
            .unwrap();
        assert!(dev
            .insert_setting("zeta", SettingsPayload::Vi(ViSettings::default()))
            .is_err());

        let keys: Vec<_> = dev.settings().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }
}
