//! Measurement executor contract and the data-row schema executors emit.
//!
//! Instrument command encoding for Sweep, Delay and VI measurements is not
//! part of the engine. Executors receive the prepared binding of their
//! category plus where the run currently is (temperature, sample), and append
//! [`DataRecord`] rows to the run's row log.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelFlag;
use crate::config::DebugOptions;
use crate::error::{MeasError, MeasResult};
use crate::rowlog::RowLog;
use crate::settings::{Category, CategoryBinding};

/// Everything an executor may read during one invocation.
pub struct ExecutionContext<'a> {
    pub binding: &'a CategoryBinding,
    /// Current set point; `None` outside multi-temperature mode.
    pub temperature: Option<f64>,
    /// Current sample; `None` outside multi-sample mode.
    pub sample: Option<u8>,
    pub debug: &'a DebugOptions,
    /// Executors may poll this to stop early; the engine does not require it.
    pub cancel: &'a CancelFlag,
}

/// Executes the measurements of one category.
///
/// Return `MeasError::Warning` for failures that should only be annotated;
/// any other error aborts the run.
#[async_trait]
pub trait CategoryExecutor: Send + Sync {
    fn category(&self) -> Category;

    async fn execute(&self, ctx: &ExecutionContext<'_>, log: &mut RowLog) -> MeasResult<()>;
}

/// One measured value, the unit of the row log's data rows.
///
/// Serialized as a single CSV record:
/// `temperature,sample,tab,item,value,unit` with empty fields for absent
/// temperature/sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub temperature: Option<f64>,
    pub sample: Option<u8>,
    pub tab: String,
    pub item: String,
    pub value: f64,
    pub unit: String,
}

impl DataRecord {
    /// Encode as one CSV line without terminator.
    pub fn to_row(&self) -> MeasResult<String> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.serialize(self)?;
        let bytes = writer
            .into_inner()
            .map_err(|e| MeasError::Io(e.into_error()))?;
        let line = String::from_utf8_lossy(&bytes);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Decode a line produced by [`DataRecord::to_row`].
    pub fn parse(row: &str) -> MeasResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(row.as_bytes());
        match reader.deserialize().next() {
            Some(record) => Ok(record?),
            None => Err(MeasError::warning(format!("Empty data row '{}'", row))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_encodes_absent_fields_as_empty() {
        let record = DataRecord {
            temperature: None,
            sample: Some(2),
            tab: "vi, main".into(),
            item: "Iout".into(),
            value: 0.25,
            unit: "A".into(),
        };
        let row = record.to_row().unwrap();
        assert_eq!(row, ",2,\"vi, main\",Iout,0.25,A");
        assert_eq!(DataRecord::parse(&row).unwrap(), record);
    }

    #[test]
    fn garbage_row_is_rejected() {
        assert!(DataRecord::parse("25,x,tab,item,notanumber,V").is_err());
    }
}
