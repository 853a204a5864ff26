//! Append-only row log of a run.
//!
//! Holds data rows and annotation rows in chronological order. When rendered
//! as text an annotation starts with [`ANNOTATION_MARKER`]; a data row that
//! happens to start with the marker (or with the escape) gets one
//! [`ESCAPE`] prepended, so [`RowLog::from_lines`] splits a rendering back
//! into the same entries.

use serde::Serialize;

/// Leading marker of an annotation line.
pub const ANNOTATION_MARKER: char = '#';

/// Prefix that protects data rows beginning with the marker.
pub const ESCAPE: char = '\\';

/// One entry of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Row {
    Data(String),
    Annotation(String),
}

impl Row {
    /// Text form of the entry.
    pub fn render(&self) -> String {
        match self {
            Row::Annotation(text) => format!("{}{}", ANNOTATION_MARKER, text),
            Row::Data(text) if text.starts_with(ANNOTATION_MARKER) || text.starts_with(ESCAPE) => {
                format!("{}{}", ESCAPE, text)
            }
            Row::Data(text) => text.clone(),
        }
    }

    /// Inverse of [`Row::render`].
    pub fn parse(line: &str) -> Row {
        if let Some(text) = line.strip_prefix(ANNOTATION_MARKER) {
            Row::Annotation(text.to_string())
        } else if let Some(text) = line.strip_prefix(ESCAPE) {
            Row::Data(text.to_string())
        } else {
            Row::Data(line.to_string())
        }
    }
}

/// Chronological record of data and annotations for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RowLog {
    rows: Vec<Row>,
}

impl RowLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from rendered lines.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            rows: lines.into_iter().map(|l| Row::parse(l.as_ref())).collect(),
        }
    }

    pub fn push_data(&mut self, row: impl Into<String>) {
        self.rows.push(Row::Data(row.into()));
    }

    pub fn annotate(&mut self, message: impl Into<String>) {
        self.rows.push(Row::Annotation(message.into()));
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Data rows only, in order.
    pub fn data_rows(&self) -> Vec<&str> {
        self.rows
            .iter()
            .filter_map(|r| match r {
                Row::Data(text) => Some(text.as_str()),
                Row::Annotation(_) => None,
            })
            .collect()
    }

    /// Annotation texts (without marker), in order.
    pub fn annotations(&self) -> Vec<&str> {
        self.rows
            .iter()
            .filter_map(|r| match r {
                Row::Annotation(text) => Some(text.as_str()),
                Row::Data(_) => None,
            })
            .collect()
    }

    pub fn data_len(&self) -> usize {
        self.rows.iter().filter(|r| matches!(r, Row::Data(_))).count()
    }

    /// Rendered lines, annotations included.
    pub fn lines(&self) -> Vec<String> {
        self.rows.iter().map(Row::render).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_order_and_excludes_annotations() {
        let mut log = RowLog::new();
        log.annotate("start");
        log.push_data("25,1,vi,I,0.1,A");
        log.annotate("Sample 2: relay on failed");
        log.push_data("25,3,vi,I,0.2,A");

        assert_eq!(log.data_rows(), vec!["25,1,vi,I,0.1,A", "25,3,vi,I,0.2,A"]);
        assert_eq!(log.annotations(), vec!["start", "Sample 2: relay on failed"]);
        assert_eq!(log.data_len(), 2);
    }

    #[test]
    fn rendering_is_lossless() {
        let mut log = RowLog::new();
        log.push_data("#not an annotation");
        log.push_data("\\leading escape");
        log.annotate("real annotation");
        log.push_data("");

        let rebuilt = RowLog::from_lines(log.lines());
        assert_eq!(rebuilt, log);
        assert_eq!(rebuilt.data_len(), 3);
    }
}
