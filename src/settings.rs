//! Per-tab measurement settings.
//!
//! A tab is one user-configured measurement scenario inside a category. The
//! engine treats the category payload as opaque except for the structural
//! checks in [`crate::validation`]; executors interpret it.

use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceId};

/// Measurement discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Stepped source ramp.
    Sweep,
    /// Timing / propagation measurement.
    Delay,
    /// Voltage/current snapshot.
    Vi,
}

impl Category {
    /// Execution order within one relay step.
    pub const ALL: [Category; 3] = [Category::Sweep, Category::Delay, Category::Vi];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Sweep => write!(f, "Sweep"),
            Category::Delay => write!(f, "Delay"),
            Category::Vi => write!(f, "VI"),
        }
    }
}

/// One source channel used by a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceChannel {
    pub device: DeviceId,
    pub channel: u8,
    /// Range token: `AUTO` or `<number><m|u|><unit>`.
    pub range: String,
    #[serde(default)]
    pub level: f64,
}

/// A raw free-text input that must parse as a decimal number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericInput {
    pub label: String,
    pub raw: String,
}

impl NumericInput {
    pub fn new(label: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            raw: raw.into(),
        }
    }
}

/// Sweep tab payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepSettings {
    pub sweep_source: Option<DeviceId>,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

/// Delay tab payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelaySettings {
    pub trigger_channel: Option<u8>,
    pub measure_channel: Option<u8>,
    #[serde(default)]
    pub threshold: f64,
}

/// VI tab payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViSettings {
    #[serde(default)]
    pub samples_per_point: u32,
}

/// Category-specific settings of a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SettingsPayload {
    Sweep(SweepSettings),
    Delay(DelaySettings),
    Vi(ViSettings),
}

impl SettingsPayload {
    pub fn category(&self) -> Category {
        match self {
            SettingsPayload::Sweep(_) => Category::Sweep,
            SettingsPayload::Delay(_) => Category::Delay,
            SettingsPayload::Vi(_) => Category::Vi,
        }
    }
}

/// One measurement tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabConfig {
    pub name: String,
    /// "Measure on" flag; disabled tabs are ignored by the run.
    #[serde(default)]
    pub measure_on: bool,
    #[serde(default)]
    pub sources: Vec<SourceChannel>,
    /// Non-source instruments used by the tab.
    #[serde(default)]
    pub instruments: Vec<DeviceId>,
    #[serde(default)]
    pub numeric_inputs: Vec<NumericInput>,
    pub payload: SettingsPayload,
}

impl TabConfig {
    pub fn new(name: impl Into<String>, payload: SettingsPayload) -> Self {
        Self {
            name: name.into(),
            measure_on: true,
            sources: Vec::new(),
            instruments: Vec::new(),
            numeric_inputs: Vec::new(),
            payload,
        }
    }

    pub fn category(&self) -> Category {
        self.payload.category()
    }

    /// Every device the tab touches, sources first, without duplicates.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = Vec::new();
        for id in self
            .sources
            .iter()
            .map(|s| s.device)
            .chain(self.instruments.iter().copied())
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// All tabs configured by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabSet {
    #[serde(default)]
    pub tabs: Vec<TabConfig>,
}

impl TabSet {
    pub fn new(tabs: Vec<TabConfig>) -> Self {
        Self { tabs }
    }

    /// Enabled tabs of one category, in configuration order.
    pub fn enabled(&self, category: Category) -> Vec<&TabConfig> {
        self.tabs
            .iter()
            .filter(|t| t.measure_on && t.category() == category)
            .collect()
    }

    /// Categories with at least one enabled tab.
    pub fn enabled_categories(&self) -> Vec<Category> {
        Category::ALL
            .into_iter()
            .filter(|c| !self.enabled(*c).is_empty())
            .collect()
    }
}

/// Devices and tabs prepared for one category; read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryBinding {
    pub category: Category,
    pub tabs: Vec<TabConfig>,
    pub devices: Vec<Device>,
}

impl CategoryBinding {
    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vi_tab(name: &str, on: bool) -> TabConfig {
        let mut tab = TabConfig::new(name, SettingsPayload::Vi(ViSettings::default()));
        tab.measure_on = on;
        tab
    }

    #[test]
    fn enabled_categories_follow_measure_on() {
        let mut sweep = TabConfig::new("ramp", SettingsPayload::Sweep(SweepSettings::default()));
        sweep.measure_on = false;
        let set = TabSet::new(vec![sweep, vi_tab("vi-a", true), vi_tab("vi-b", false)]);

        assert_eq!(set.enabled_categories(), vec![Category::Vi]);
        assert_eq!(set.enabled(Category::Vi).len(), 1);
    }

    #[test]
    fn tab_devices_are_deduplicated() {
        let mut tab = vi_tab("vi", true);
        tab.sources.push(SourceChannel {
            device: DeviceId::Source1,
            channel: 1,
            range: "10V".into(),
            level: 1.0,
        });
        tab.sources.push(SourceChannel {
            device: DeviceId::Source1,
            channel: 2,
            range: "10V".into(),
            level: 2.0,
        });
        tab.instruments = vec![DeviceId::Dmm1, DeviceId::Source1];
        assert_eq!(tab.devices(), vec![DeviceId::Source1, DeviceId::Dmm1]);
    }

    #[test]
    fn payload_deserializes_from_toml() {
        let tab: TabConfig = toml::from_str(
            r#"
            name = "ramp"
            measure_on = true
            [payload]
            kind = "sweep"
            sweep_source = "SOURCE2"
            start = 0.0
            stop = 5.0
            step = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(tab.category(), Category::Sweep);
        match tab.payload {
            SettingsPayload::Sweep(s) => assert_eq!(s.sweep_source, Some(DeviceId::Source2)),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
