//! Result aggregation and report output.
//!
//! The engine hands the data rows of a finished run to a [`ResultAggregator`],
//! which reshapes them into a pivoted table and renders the settings footer.
//! [`ReportWriter`] persists the resulting lines as a CSV file.
//!
//! Pivot layout produced by [`PivotAggregator`]:
//!
//! | Tab | Item | Unit | 25°C/S1 | 25°C/S2 | 85°C/S1 | ... |
//! |-----|------|------|---------|---------|---------|-----|
//!
//! Columns follow the order in which (temperature, sample) pairs first appear
//! in the run. Without multi-temperature or multi-sample mode the
//! corresponding half of the key is dropped; with neither there is a single
//! `Value` column.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{MeasError, MeasResult};
use crate::executor::DataRecord;

/// Header line opening the settings footer.
pub const FOOTER_MARKER: &str = "[Settings]";

/// Stem used when the caller does not name the report.
pub const DEFAULT_REPORT_STEM: &str = "ResultData";

/// Reshapes raw data rows into report lines.
pub trait ResultAggregator: Send + Sync {
    /// Pivot the chronological data rows into one line per measured quantity.
    fn create_pivot_rows(
        &self,
        data_rows: &[&str],
        multi_temperature: bool,
        multi_sample: bool,
    ) -> MeasResult<Vec<String>>;

    /// Render the instrument configuration used for the run.
    fn build_settings_footer(&self, devices: &[Device]) -> MeasResult<Vec<String>>;
}

/// Default aggregator for [`DataRecord`] rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct PivotAggregator;

#[derive(Debug, Clone, Copy, PartialEq)]
struct ColumnKey {
    temperature: Option<f64>,
    sample: Option<u8>,
}

impl ColumnKey {
    fn label(&self) -> String {
        match (self.temperature, self.sample) {
            (Some(t), Some(s)) => format!("{}°C/S{}", t, s),
            (Some(t), None) => format!("{}°C", t),
            (None, Some(s)) => format!("S{}", s),
            (None, None) => "Value".to_string(),
        }
    }
}

struct PivotRow {
    tab: String,
    item: String,
    unit: String,
    cells: Vec<Vec<f64>>,
}

impl ResultAggregator for PivotAggregator {
    fn create_pivot_rows(
        &self,
        data_rows: &[&str],
        multi_temperature: bool,
        multi_sample: bool,
    ) -> MeasResult<Vec<String>> {
        let mut columns: Vec<ColumnKey> = Vec::new();
        let mut rows: Vec<PivotRow> = Vec::new();

        for raw in data_rows {
            let record = match DataRecord::parse(raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(row = %raw, error = %e, "Skipping malformed data row");
                    continue;
                }
            };

            let key = ColumnKey {
                temperature: record.temperature.filter(|_| multi_temperature),
                sample: record.sample.filter(|_| multi_sample),
            };
            let column = match columns.iter().position(|c| *c == key) {
                Some(index) => index,
                None => {
                    columns.push(key);
                    columns.len() - 1
                }
            };

            let row = match rows.iter().position(|r| {
                r.tab == record.tab && r.item == record.item && r.unit == record.unit
            }) {
                Some(index) => &mut rows[index],
                None => {
                    rows.push(PivotRow {
                        tab: record.tab.clone(),
                        item: record.item.clone(),
                        unit: record.unit.clone(),
                        cells: Vec::new(),
                    });
                    let last = rows.len() - 1;
                    &mut rows[last]
                }
            };
            if row.cells.len() <= column {
                row.cells.resize(column + 1, Vec::new());
            }
            row.cells[column].push(record.value);
        }

        let mut lines = Vec::with_capacity(rows.len() + 1);
        let mut header = vec!["Tab".to_string(), "Item".to_string(), "Unit".to_string()];
        header.extend(columns.iter().map(ColumnKey::label));
        lines.push(csv_line(&header)?);

        for row in rows {
            let mut fields = vec![row.tab, row.item, row.unit];
            for column in 0..columns.len() {
                // Repeated readings of one quantity in one column are kept side by side.
                let cell = row
                    .cells
                    .get(column)
                    .map(|values| {
                        values
                            .iter()
                            .map(f64::to_string)
                            .collect::<Vec<_>>()
                            .join(";")
                    })
                    .unwrap_or_default();
                fields.push(cell);
            }
            lines.push(csv_line(&fields)?);
        }
        debug!(columns = columns.len(), lines = lines.len(), "Pivoted data rows");
        Ok(lines)
    }

    fn build_settings_footer(&self, devices: &[Device]) -> MeasResult<Vec<String>> {
        let mut lines = vec![
            FOOTER_MARKER.to_string(),
            csv_line(&["Device", "Name", "Address", "Tab", "Settings"])?,
        ];
        for device in devices {
            if device.settings_len() == 0 {
                lines.push(csv_line(&[
                    device.id.tag(),
                    device.name.as_str(),
                    device.address.as_str(),
                    "",
                    "",
                ])?);
                continue;
            }
            for (tab, payload) in device.settings() {
                let json = serde_json::to_string(payload).map_err(|e| {
                    MeasError::fatal(format!("Cannot render settings of {}: {}", device.id, e))
                })?;
                lines.push(csv_line(&[
                    device.id.tag(),
                    device.name.as_str(),
                    device.address.as_str(),
                    tab,
                    json.as_str(),
                ])?);
            }
        }
        Ok(lines)
    }
}

fn csv_line<I, T>(fields: I) -> MeasResult<String>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| MeasError::Io(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string())
}

/// Character encoding of the report file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportEncoding {
    #[default]
    Utf8,
    /// Legacy Japanese encoding expected by older spreadsheet tooling
    ShiftJis,
}

impl ReportEncoding {
    /// Encode `text`; characters Shift_JIS cannot represent become numeric
    /// character references.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            ReportEncoding::Utf8 => text.as_bytes().to_vec(),
            ReportEncoding::ShiftJis => {
                let (bytes, _, had_errors) = encoding_rs::SHIFT_JIS.encode(text);
                if had_errors {
                    warn!("Report contains characters not representable in Shift_JIS");
                }
                bytes.into_owned()
            }
        }
    }
}

/// Writes report lines to a CSV file.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    directory: PathBuf,
    encoding: ReportEncoding,
}

impl ReportWriter {
    pub fn new(directory: impl Into<PathBuf>, encoding: ReportEncoding) -> Self {
        Self {
            directory: directory.into(),
            encoding,
        }
    }

    /// File path for a report named `output_name`, or the timestamped
    /// default `ResultData_<YYYYmmdd_HHMMSS>.csv`.
    ///
    /// The name must be a plain file name; one trailing `.csv` is dropped.
    pub fn path_for(&self, output_name: Option<&str>) -> MeasResult<PathBuf> {
        let stem = match output_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => {
                let stem = name.strip_suffix(".csv").unwrap_or(name);
                let mut parts = Path::new(stem).components();
                let plain = matches!(
                    (parts.next(), parts.next()),
                    (Some(Component::Normal(_)), None)
                ) && !stem.contains(['/', '\\']);
                if !plain {
                    return Err(MeasError::fatal(format!(
                        "Report name '{}' must be a plain file name",
                        name
                    )));
                }
                stem.to_string()
            }
            None => format!(
                "{}_{}",
                DEFAULT_REPORT_STEM,
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            ),
        };
        Ok(self.directory.join(format!("{}.csv", stem)))
    }

    /// Write `lines` (CRLF-terminated) and return the file path.
    pub async fn write(&self, output_name: Option<&str>, lines: &[String]) -> MeasResult<PathBuf> {
        let path = self.path_for(output_name)?;
        tokio::fs::create_dir_all(&self.directory).await?;

        let mut text = lines.join("\r\n");
        text.push_str("\r\n");
        tokio::fs::write(&path, self.encoding.encode(&text)).await?;

        info!(path = %path.display(), lines = lines.len(), encoding = ?self.encoding, "Report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use crate::settings::{SettingsPayload, ViSettings};

    fn row(temperature: Option<f64>, sample: Option<u8>, item: &str, value: f64) -> String {
        DataRecord {
            temperature,
            sample,
            tab: "vi".into(),
            item: item.into(),
            value,
            unit: "V".into(),
        }
        .to_row()
        .unwrap()
    }

    #[test]
    fn pivots_by_temperature_and_sample() {
        let rows = vec![
            row(Some(25.0), Some(1), "Vout", 1.0),
            row(Some(25.0), Some(2), "Vout", 1.1),
            row(Some(85.0), Some(1), "Vout", 0.9),
            row(Some(85.0), Some(2), "Vout", 0.8),
        ];
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();

        let lines = PivotAggregator
            .create_pivot_rows(&refs, true, true)
            .unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "Tab,Item,Unit,25°C/S1,25°C/S2,85°C/S1,85°C/S2");
        assert_eq!(lines[1], "vi,Vout,V,1,1.1,0.9,0.8");
    }

    #[test]
    fn single_pass_uses_value_column_and_skips_garbage() {
        let rows = vec![
            row(None, None, "Vout", 1.0),
            "not,a,record".to_string(),
            row(None, None, "Iout", 0.5),
        ];
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();

        let lines = PivotAggregator
            .create_pivot_rows(&refs, false, false)
            .unwrap();
        assert_eq!(
            lines,
            vec!["Tab,Item,Unit,Value", "vi,Vout,V,1", "vi,Iout,V,0.5"]
        );
    }

    #[test]
    fn missing_cells_stay_empty() {
        let rows = vec![row(None, Some(1), "Vout", 1.0), row(None, Some(3), "Iout", 2.0)];
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();

        let lines = PivotAggregator
            .create_pivot_rows(&refs, false, true)
            .unwrap();
        assert_eq!(lines[0], "Tab,Item,Unit,S1,S3");
        assert_eq!(lines[1], "vi,Vout,V,1,");
        assert_eq!(lines[2], "vi,Iout,V,,2");
    }

    #[test]
    fn footer_lists_devices_and_settings() {
        let mut dmm = Device::new(DeviceId::Dmm1, "GPIB0::22::INSTR", "DMM 1");
        dmm.insert_setting(
            "vi-main",
            SettingsPayload::Vi(ViSettings {
                samples_per_point: 4,
            }),
        )
        .unwrap();
        let relay = Device::new(DeviceId::Relay, "FT5XKQ1", "Relay Board");

        let lines = PivotAggregator
            .build_settings_footer(&[dmm, relay])
            .unwrap();
        assert_eq!(lines[0], FOOTER_MARKER);
        assert_eq!(lines[1], "Device,Name,Address,Tab,Settings");
        assert!(lines[2].starts_with("DMM1,DMM 1,GPIB0::22::INSTR,vi-main,"));
        assert!(lines[2].contains("samples_per_point"));
        assert_eq!(lines[3], "RELAY,Relay Board,FT5XKQ1,,");
    }

    #[test]
    fn shift_jis_encodes_japanese_text() {
        let bytes = ReportEncoding::ShiftJis.encode("温度");
        assert_eq!(bytes, vec![0x89, 0xB7, 0x93, 0x78]);
        assert_eq!(ReportEncoding::Utf8.encode("温度"), "温度".as_bytes());
    }

    #[test]
    fn default_name_is_timestamped() {
        let writer = ReportWriter::new("out", ReportEncoding::Utf8);
        let path = writer.path_for(None).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("ResultData_"));
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "ResultData_20240101_120000.csv".len());

        assert_eq!(writer.path_for(Some("lot7")).unwrap(), Path::new("out").join("lot7.csv"));
        assert_eq!(writer.path_for(Some("lot7.csv")).unwrap(), Path::new("out").join("lot7.csv"));
    }

    #[test]
    fn only_one_csv_suffix_is_dropped() {
        let writer = ReportWriter::new("out", ReportEncoding::Utf8);
        assert_eq!(
            writer.path_for(Some("a.csv.csv")).unwrap(),
            Path::new("out").join("a.csv.csv")
        );
    }

    #[test]
    fn names_with_path_components_are_rejected() {
        let writer = ReportWriter::new("out", ReportEncoding::Utf8);
        for name in ["../escape", "/tmp/abs", "sub/lot7", "sub\\lot7", "..", ".csv"] {
            assert!(writer.path_for(Some(name)).is_err(), "name {}", name);
        }
    }

    #[tokio::test]
    async fn rejected_name_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path().join("reports"), ReportEncoding::Utf8);

        let result = writer.write(Some("../outside"), &["Tab".to_string()]).await;
        assert!(result.is_err());
        assert!(!dir.path().join("reports").exists());
        assert!(!dir.path().join("outside.csv").exists());
    }

    #[tokio::test]
    async fn writes_encoded_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path().join("reports"), ReportEncoding::ShiftJis);

        let path = writer
            .write(Some("run"), &["Tab,Item".to_string(), "温度,1".to_string()])
            .await
            .unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let (text, _, _) = encoding_rs::SHIFT_JIS.decode(&bytes);
        assert_eq!(text, "Tab,Item\r\n温度,1\r\n");
    }
}
