//! Runs in its own test binary because it installs the process-global
//! tracing subscriber, which conflicts with `#[traced_test]` in unit tests.

use tempchar::logging::{init, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn init_twice_is_harmless() {
    assert!(init(TracingConfig::new(Level::WARN)).is_ok());
    assert!(init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json)).is_ok());
}
