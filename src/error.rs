//! Error types for the measurement engine.
//!
//! `MeasError` is the single error enum that flows through the orchestration
//! pipeline. Expected failures carry a [`Severity`] so the pipeline can decide
//! whether to abort the run or to record an annotation and keep going:
//!
//! - **`Fatal`**: the condition invalidates the rest of the run (bad addresses,
//!   declined auto-range confirmation, thermal controller init failure). It is
//!   propagated with `?`, caught once at the top of the run and recorded.
//! - **`Warning`**: the condition is surfaced but the run continues (a single
//!   temperature point or relay step failing, missing category data).
//! - **`Cancelled`**: always caller-initiated. It is neither fatal nor a
//!   warning; finalization tags the run as interrupted.
//!
//! Infrastructure errors (`Io`, `Csv`, `Config`, ...) convert with `#[from]` and
//! classify as fatal.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type MeasResult<T> = std::result::Result<T, MeasError>;

/// Propagation severity of an expected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Invalidates the rest of the run.
    Fatal,
    /// Recorded inline; execution continues with the next unit of work.
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Fatal => write!(f, "fatal"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// Primary error type of the engine.
#[derive(Error, Debug)]
pub enum MeasError {
    #[error("{0}")]
    Fatal(String),

    #[error("{0}")]
    Warning(String),

    #[error("Run cancelled by user")]
    Cancelled,

    #[error("Engine busy: {0}")]
    Busy(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl MeasError {
    /// Create a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        MeasError::Fatal(message.into())
    }

    /// Create a warning.
    pub fn warning(message: impl Into<String>) -> Self {
        MeasError::Warning(message.into())
    }

    /// Severity used by the pipeline. Cancellation reports `None`.
    pub fn severity(&self) -> Option<Severity> {
        match self {
            MeasError::Warning(_) => Some(Severity::Warning),
            MeasError::Cancelled => None,
            _ => Some(Severity::Fatal),
        }
    }

    /// Whether this error is the caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MeasError::Cancelled)
    }

    /// Escalate a warning to fatal. Used when `stop_on_warning` is set.
    pub fn escalate(self) -> Self {
        match self {
            MeasError::Warning(msg) => MeasError::Fatal(msg),
            other => other,
        }
    }
}

impl From<figment::Error> for MeasError {
    fn from(err: figment::Error) -> Self {
        MeasError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_classification() {
        assert_eq!(MeasError::fatal("x").severity(), Some(Severity::Fatal));
        assert_eq!(MeasError::warning("x").severity(), Some(Severity::Warning));
        assert_eq!(MeasError::Cancelled.severity(), None);
        assert_eq!(
            MeasError::Instrument("timeout".into()).severity(),
            Some(Severity::Fatal)
        );
    }

    #[test]
    fn escalate_only_touches_warnings() {
        assert!(matches!(
            MeasError::warning("relay").escalate(),
            MeasError::Fatal(m) if m == "relay"
        ));
        assert!(MeasError::Cancelled.escalate().is_cancelled());
    }
}
