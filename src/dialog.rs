//! User interaction at the two points where the engine needs it: the
//! auto-range confirmation gate and the completion message.

use async_trait::async_trait;
use std::io::{BufRead, Write};
use tracing::{error, info, warn};

/// Capability: ask the operator and report to the operator.
#[async_trait]
pub trait Dialog: Send + Sync {
    /// Blocking yes/no question. `true` means proceed.
    async fn confirm(&self, title: &str, message: &str) -> bool;

    fn show_message(&self, title: &str, message: &str);

    fn show_error(&self, title: &str, message: &str);
}

/// Terminal dialog used by the CLI.
#[derive(Debug, Clone, Default)]
pub struct ConsoleDialog {
    /// Answer every confirmation with yes without prompting
    pub assume_yes: bool,
}

impl ConsoleDialog {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

#[async_trait]
impl Dialog for ConsoleDialog {
    async fn confirm(&self, title: &str, message: &str) -> bool {
        if self.assume_yes {
            info!(title, "Confirmation assumed");
            return true;
        }
        let prompt = format!("== {} ==\n{}\nContinue? [y/N] ", title, message);
        let answer = tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(prompt.as_bytes());
            let _ = stdout.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not read confirmation, declining");
                false
            }
            Err(e) => {
                warn!(error = %e, "Confirmation prompt aborted, declining");
                false
            }
        }
    }

    fn show_message(&self, title: &str, message: &str) {
        info!(title, "Run finished");
        println!("== {} ==\n{}", title, message);
    }

    fn show_error(&self, title: &str, message: &str) {
        error!(title, "Run failed");
        eprintln!("== {} ==\n{}", title, message);
    }
}
