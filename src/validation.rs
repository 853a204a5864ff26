//! Address and settings validation.
//!
//! Every rule returns a [`Verdict`]. Rules never short-circuit one another:
//! the aggregate is the AND of all rule results and carries every message, in
//! rule order, so the messages shown to the operator are reproducible.
//!
//! The auto-range rule is the exception to "failure": it only produces
//! warnings, which the orchestrator turns into a confirmation request.

use crate::config::RunSettings;
use crate::device::{AddressRecord, DeviceId, RESOURCE_MARKER};
use crate::relay::RELAY_PIN_COUNT;
use crate::settings::{CategoryBinding, NumericInput, SettingsPayload, TabConfig};

/// Range sentinel for instrument-selected ranging.
pub const AUTO_RANGE: &str = "AUTO";

/// Messages and pass/fail of one rule or of an aggregate of rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub messages: Vec<String>,
    pub ok: bool,
}

impl Default for Verdict {
    fn default() -> Self {
        Self::pass()
    }
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            messages: Vec::new(),
            ok: true,
        }
    }

    /// Record a failure; the verdict stays failed from here on.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.ok = false;
        self.messages.push(message.into());
    }

    /// Record a message that does not affect `ok`.
    pub fn note(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// AND another verdict into this one, keeping all its messages.
    pub fn merge(&mut self, other: Verdict) {
        self.ok &= other.ok;
        self.messages.extend(other.messages);
    }
}

/// Extract the unit part of a range token.
///
/// `AUTO` passes through. Otherwise a leading run of digits is stripped, then
/// at most one `m`, then at most one `u`.
pub fn get_range_unit(token: &str) -> &str {
    if token == AUTO_RANGE {
        return token;
    }
    let rest = token.trim_start_matches(|c: char| c.is_ascii_digit());
    let rest = rest.strip_prefix('m').unwrap_or(rest);
    rest.strip_prefix('u').unwrap_or(rest)
}

/// Parse a free-text decimal independent of locale.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Rule set for addresses and tab settings.
///
/// Constructed once and handed to the registry and the engine.
#[derive(Debug, Clone)]
pub struct Validator {
    marker: String,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self {
            marker: RESOURCE_MARKER.to_string(),
        }
    }

    /// Rule 1: no two devices may share a non-blank address.
    ///
    /// One message per duplicated value, in order of first occurrence.
    pub fn check_duplicate_addresses(&self, records: &[AddressRecord]) -> Verdict {
        let mut verdict = Verdict::pass();
        let mut seen: Vec<(&str, Vec<DeviceId>)> = Vec::new();

        for record in records.iter().filter(|r| !r.address.trim().is_empty()) {
            match seen.iter_mut().find(|(addr, _)| *addr == record.address) {
                Some((_, ids)) => ids.push(record.id),
                None => seen.push((record.address.as_str(), vec![record.id])),
            }
        }

        for (address, ids) in seen.into_iter().filter(|(_, ids)| ids.len() > 1) {
            let ids: Vec<&str> = ids.iter().map(|id| id.tag()).collect();
            verdict.fail(format!(
                "Duplicate address '{}' used by {}",
                address,
                ids.join(", ")
            ));
        }
        verdict
    }

    /// Rule 2: checked devices must not have whitespace in their address.
    pub fn check_whitespace(&self, records: &[AddressRecord]) -> Verdict {
        let mut verdict = Verdict::pass();
        for record in records.iter().filter(|r| r.checked) {
            if record.address.chars().any(char::is_whitespace) {
                verdict.fail(format!(
                    "{} ({}): address '{}' contains whitespace",
                    record.name, record.id, record.address
                ));
            }
        }
        verdict
    }

    /// Rule 3: checked bus devices must carry the resource marker. The relay
    /// controller is addressed by serial number and exempt whatever its
    /// address holds.
    pub fn check_required_marker(&self, records: &[AddressRecord]) -> Verdict {
        let mut verdict = Verdict::pass();
        for record in records.iter().filter(|r| r.checked && !r.id.is_relay()) {
            if !record.address.contains(self.marker.as_str()) {
                verdict.fail(format!(
                    "{} ({}): address '{}' does not contain '{}'",
                    record.name, record.id, record.address, self.marker
                ));
            }
        }
        verdict
    }

    /// Rules 1–3, all run, messages in rule order.
    pub fn validate_addresses(&self, records: &[AddressRecord]) -> Verdict {
        let mut verdict = self.check_duplicate_addresses(records);
        verdict.merge(self.check_whitespace(records));
        verdict.merge(self.check_required_marker(records));
        verdict
    }

    /// Rule 4: every raw input of a tab must parse as a decimal number.
    pub fn check_numeric(&self, tab: &str, inputs: &[NumericInput]) -> Verdict {
        let mut verdict = Verdict::pass();
        for input in inputs {
            if parse_decimal(&input.raw).is_none() {
                verdict.fail(format!(
                    "Tab '{}': {} is not a number ('{}')",
                    tab, input.label, input.raw
                ));
            }
        }
        verdict
    }

    /// Rule 5: structural checks of one prepared category.
    pub fn check_category(&self, binding: &CategoryBinding, records: &[AddressRecord]) -> Verdict {
        let mut verdict = Verdict::pass();
        let category = binding.category;

        if binding.devices.is_empty() {
            verdict.fail(format!("{}: no selected device is bound to the enabled tabs", category));
        }

        for tab in &binding.tabs {
            for id in tab.devices() {
                let selected = records
                    .iter()
                    .any(|r| r.id == id && r.checked && !r.address.trim().is_empty());
                if !selected {
                    verdict.fail(format!(
                        "{} tab '{}': {} is used but not selected",
                        category, tab.name, id
                    ));
                }
            }
            verdict.merge(self.check_payload(tab));
        }
        verdict
    }

    fn check_payload(&self, tab: &TabConfig) -> Verdict {
        let mut verdict = Verdict::pass();
        let devices = tab.devices();
        let prefix = format!("{} tab '{}'", tab.category(), tab.name);

        match &tab.payload {
            SettingsPayload::Sweep(sweep) => {
                match sweep.sweep_source {
                    None => verdict.fail(format!("{}: sweep source is not set", prefix)),
                    Some(src) if !tab.sources.iter().any(|s| s.device == src) => verdict.fail(
                        format!("{}: sweep source {} is not one of the tab's sources", prefix, src),
                    ),
                    Some(_) => {}
                }
                if sweep.step == 0.0 {
                    verdict.fail(format!("{}: sweep step must be non-zero", prefix));
                } else if (sweep.stop - sweep.start) * sweep.step < 0.0 {
                    verdict.fail(format!(
                        "{}: stop {} is not reachable from start {} with step {}",
                        prefix, sweep.stop, sweep.start, sweep.step
                    ));
                }
            }
            SettingsPayload::Delay(delay) => {
                if !devices.contains(&DeviceId::Osc) {
                    verdict.fail(format!("{}: oscilloscope is required", prefix));
                }
                if !devices.contains(&DeviceId::Pulse) {
                    verdict.fail(format!("{}: pulse generator is required", prefix));
                }
                match (delay.trigger_channel, delay.measure_channel) {
                    (None, _) => verdict.fail(format!("{}: trigger channel is not set", prefix)),
                    (_, None) => verdict.fail(format!("{}: measure channel is not set", prefix)),
                    (Some(t), Some(m)) if t == m => verdict.fail(format!(
                        "{}: trigger and measure channels must differ (CH{})",
                        prefix, t
                    )),
                    _ => {}
                }
            }
            SettingsPayload::Vi(_) => {
                if !devices.iter().any(DeviceId::is_source) {
                    verdict.fail(format!("{}: at least one source is required", prefix));
                }
                if !devices.iter().any(DeviceId::is_dmm) {
                    verdict.fail(format!("{}: at least one DMM is required", prefix));
                }
            }
        }
        verdict
    }

    /// Rule 6: warn about source channels ranged on `AUTO`. Never fails.
    pub fn check_auto_range(&self, tabs: &[TabConfig]) -> Verdict {
        let mut verdict = Verdict::pass();
        for tab in tabs {
            for source in &tab.sources {
                if get_range_unit(&source.range) == AUTO_RANGE {
                    verdict.note(format!(
                        "Tab '{}': {} CH{} range is AUTO",
                        tab.name, source.device, source.channel
                    ));
                }
            }
        }
        verdict
    }

    /// Sanity of the temperature/sample plan.
    pub fn validate_run_plan(&self, run: &RunSettings) -> Verdict {
        let mut verdict = Verdict::pass();
        if run.multi_sample && !(1..=RELAY_PIN_COUNT).contains(&run.sample_count) {
            verdict.fail(format!(
                "Sample count {} is outside 1..={}",
                run.sample_count, RELAY_PIN_COUNT
            ));
        }
        if run.multi_temperature {
            if run.temperatures.is_empty() {
                verdict.fail("Multi-temperature mode is on but no set point is configured");
            }
            let mut seen: Vec<f64> = Vec::new();
            for &t in &run.temperatures {
                if !t.is_finite() {
                    verdict.fail(format!("Temperature set point {} is not a number", t));
                } else if seen.contains(&t) {
                    verdict.note(format!("Temperature set point {} is listed twice", t));
                } else {
                    seen.push(t);
                }
            }
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::settings::{DelaySettings, SourceChannel, SweepSettings, ViSettings};

    fn rec(id: DeviceId, checked: bool, address: &str) -> AddressRecord {
        AddressRecord::new(id, checked, address)
    }

    #[test]
    fn range_unit_examples() {
        assert_eq!(get_range_unit("AUTO"), "AUTO");
        assert_eq!(get_range_unit("10E+0"), "E+0");
        assert_eq!(get_range_unit("100mE-3"), "E-3");
        assert_eq!(get_range_unit("10uA"), "A");
        assert_eq!(get_range_unit("V"), "V");
    }

    #[test]
    fn range_unit_is_idempotent() {
        for token in ["AUTO", "10E+0", "100mE-3", "2uV", "500mA", "E-6"] {
            let once = get_range_unit(token);
            assert_eq!(get_range_unit(once), once, "token {}", token);
        }
    }

    #[test]
    fn duplicate_reports_one_message_per_value() {
        let records = vec![
            rec(DeviceId::Source1, true, "GPIB0::5::INSTR"),
            rec(DeviceId::Source2, true, "GPIB0::5::INSTR"),
            rec(DeviceId::Dmm1, true, "GPIB0::5::INSTR"),
            rec(DeviceId::Osc, true, "USB0::1::INSTR"),
            rec(DeviceId::Pulse, false, ""),
            rec(DeviceId::Dmm2, false, ""),
        ];
        let verdict = Validator::new().check_duplicate_addresses(&records);
        assert!(!verdict.ok);
        assert_eq!(verdict.messages.len(), 1);
        assert!(verdict.messages[0].contains("GPIB0::5::INSTR"));
    }

    #[test]
    fn duplicate_comparison_is_case_sensitive() {
        let records = vec![
            rec(DeviceId::Source1, true, "usb0::1::INSTR"),
            rec(DeviceId::Source2, true, "USB0::1::INSTR"),
        ];
        assert!(Validator::new().check_duplicate_addresses(&records).ok);
    }

    #[test]
    fn marker_required_except_for_relay() {
        let records = vec![
            rec(DeviceId::Source1, true, "GPIB0::5"),
            rec(DeviceId::Relay, true, "FT1234AB"),
        ];
        let verdict = Validator::new().check_required_marker(&records);
        assert!(!verdict.ok);
        assert_eq!(verdict.messages.len(), 1);
        assert!(verdict.messages[0].contains("SOURCE1"));

        let relay_only = vec![rec(DeviceId::Relay, true, "no marker here")];
        assert!(Validator::new().check_required_marker(&relay_only).ok);
    }

    #[test]
    fn blank_relay_serial_is_exempt_from_marker_rule() {
        let verdict =
            Validator::new().check_required_marker(&[rec(DeviceId::Relay, true, "")]);
        assert!(verdict.ok);
        assert!(verdict.messages.is_empty());
    }

    #[test]
    fn unchecked_devices_skip_format_rules() {
        let records = vec![rec(DeviceId::Dmm4, false, "bad address")];
        let v = Validator::new().validate_addresses(&records);
        assert!(v.ok);
        assert!(v.messages.is_empty());
    }

    #[test]
    fn aggregate_collects_every_rule_in_order() {
        let records = vec![
            rec(DeviceId::Source1, true, "A B"),
            rec(DeviceId::Source2, true, "A B"),
        ];
        let v = Validator::new().validate_addresses(&records);
        assert!(!v.ok);
        // 1 duplicate + 2 whitespace + 2 marker
        assert_eq!(v.messages.len(), 5);
        assert!(v.messages[0].starts_with("Duplicate"));
        assert!(v.messages[1].contains("whitespace"));
        assert!(v.messages[4].contains("INSTR"));
    }

    #[test]
    fn numeric_inputs_are_locale_invariant() {
        let inputs = vec![
            NumericInput::new("start", "1.5"),
            NumericInput::new("stop", "1,5"),
            NumericInput::new("step", "-2e-3"),
            NumericInput::new("hold", ""),
        ];
        let v = Validator::new().check_numeric("ramp", &inputs);
        assert!(!v.ok);
        assert_eq!(v.messages.len(), 2);
        assert!(v.messages[0].contains("stop"));
        assert!(v.messages[1].contains("hold"));
    }

    #[test]
    fn auto_range_is_a_warning_only() {
        let mut tab = TabConfig::new("vi", SettingsPayload::Vi(ViSettings::default()));
        tab.sources.push(SourceChannel {
            device: DeviceId::Source3,
            channel: 2,
            range: "AUTO".into(),
            level: 0.0,
        });
        let v = Validator::new().check_auto_range(&[tab]);
        assert!(v.ok);
        assert_eq!(v.messages, vec!["Tab 'vi': SOURCE3 CH2 range is AUTO".to_string()]);
    }

    fn binding(tab: TabConfig, records: &[AddressRecord]) -> CategoryBinding {
        let devices = records
            .iter()
            .filter(|r| r.checked && tab.devices().contains(&r.id))
            .map(Device::from_record)
            .collect();
        CategoryBinding {
            category: tab.category(),
            tabs: vec![tab],
            devices,
        }
    }

    #[test]
    fn delay_requires_scope_and_pulse() {
        let records = vec![rec(DeviceId::Osc, true, "USB0::1::INSTR")];
        let mut tab = TabConfig::new(
            "prop",
            SettingsPayload::Delay(DelaySettings {
                trigger_channel: Some(1),
                measure_channel: Some(1),
                threshold: 0.5,
            }),
        );
        tab.instruments = vec![DeviceId::Osc];
        let v = Validator::new().check_category(&binding(tab, &records), &records);
        assert!(!v.ok);
        assert!(v.messages.iter().any(|m| m.contains("pulse generator")));
        assert!(v.messages.iter().any(|m| m.contains("must differ")));
    }

    #[test]
    fn sweep_checks_source_and_direction() {
        let records = vec![rec(DeviceId::Source1, true, "GPIB0::1::INSTR")];
        let mut tab = TabConfig::new(
            "ramp",
            SettingsPayload::Sweep(SweepSettings {
                sweep_source: Some(DeviceId::Source2),
                start: 0.0,
                stop: 5.0,
                step: -1.0,
            }),
        );
        tab.sources.push(SourceChannel {
            device: DeviceId::Source1,
            channel: 1,
            range: "10V".into(),
            level: 0.0,
        });
        let v = Validator::new().check_category(&binding(tab, &records), &records);
        assert!(!v.ok);
        assert_eq!(v.messages.len(), 2);
        assert!(v.messages.iter().all(|m| m.starts_with("Sweep tab 'ramp'")));
    }

    #[test]
    fn unselected_device_fails_category() {
        let records = vec![
            rec(DeviceId::Source1, true, "GPIB0::1::INSTR"),
            rec(DeviceId::Dmm1, false, "GPIB0::2::INSTR"),
        ];
        let mut tab = TabConfig::new("vi", SettingsPayload::Vi(ViSettings::default()));
        tab.sources.push(SourceChannel {
            device: DeviceId::Source1,
            channel: 1,
            range: "10V".into(),
            level: 1.0,
        });
        tab.instruments = vec![DeviceId::Dmm1];
        let v = Validator::new().check_category(&binding(tab, &records), &records);
        assert!(!v.ok);
        assert!(v.messages[0].contains("DMM1 is used but not selected"));
    }

    #[test]
    fn run_plan_limits_sample_count() {
        let run = RunSettings {
            multi_sample: true,
            sample_count: 7,
            ..RunSettings::default()
        };
        assert!(!Validator::new().validate_run_plan(&run).ok);

        let run = RunSettings {
            multi_temperature: true,
            temperatures: vec![],
            ..RunSettings::default()
        };
        assert!(!Validator::new().validate_run_plan(&run).ok);
    }
}
