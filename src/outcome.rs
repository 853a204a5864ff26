//! Success/failure value returned by user-facing operations.
//!
//! Expected failures (no device selected, nothing discovered, a probe that did
//! not answer) are values, not errors: the caller shows the message either way.

use serde::Serialize;

/// Result of a fallible user-facing operation.
///
/// A failed outcome never carries a payload. A successful one may carry an
/// empty message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T = ()> {
    ok: bool,
    message: String,
    payload: Option<T>,
}

impl<T> Outcome<T> {
    /// Successful outcome without payload.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            payload: None,
        }
    }

    /// Successful outcome carrying a payload.
    pub fn ok_with(payload: T, message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            payload: Some(payload),
        }
    }

    /// Failed outcome.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            payload: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }
}

impl<T> std::fmt::Display for Outcome<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.ok { "OK" } else { "FAIL" };
        if self.message.is_empty() {
            write!(f, "{}", status)
        } else {
            write!(f, "{}: {}", status, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_has_no_payload() {
        let out: Outcome<Vec<u8>> = Outcome::fail("nope");
        assert!(!out.is_ok());
        assert!(out.payload().is_none());
        assert_eq!(out.to_string(), "FAIL: nope");
    }

    #[test]
    fn ok_may_have_empty_message() {
        let out = Outcome::ok_with(3, "");
        assert!(out.is_ok());
        assert_eq!(out.payload(), Some(&3));
        assert_eq!(out.to_string(), "OK");
    }
}
