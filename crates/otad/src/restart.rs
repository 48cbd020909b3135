//! Device restart through an external command.

use ota_common::Restarter;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Runs the configured restart command (default `systemctl reboot`)
#[derive(Debug)]
pub struct CommandRestarter {
    command: Vec<String>,
    succeeded: AtomicBool,
}

impl CommandRestarter {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            succeeded: AtomicBool::new(false),
        }
    }

    /// True once a restart command exited successfully
    pub fn succeeded(&self) -> bool {
        self.succeeded.load(Ordering::SeqCst)
    }

    fn run(&self) -> Result<(), String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| "Restart command is empty".to_string())?;

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| format!("{} failed: {}", program, e))?;

        if !output.status.success() {
            return Err(format!(
                "Restart command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

impl Restarter for CommandRestarter {
    fn restart(&self) {
        info!("Restarting device: {}", self.command.join(" "));
        match self.run() {
            Ok(()) => self.succeeded.store(true, Ordering::SeqCst),
            Err(e) => error!("{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_command() {
        let restarter = CommandRestarter::new(vec!["true".to_string()]);
        restarter.restart();
        assert!(restarter.succeeded());
    }

    #[test]
    fn test_failing_command_is_logged_only() {
        let restarter = CommandRestarter::new(vec!["false".to_string()]);
        restarter.restart();
        assert!(!restarter.succeeded());
    }

    #[test]
    fn test_missing_program() {
        let restarter = CommandRestarter::new(vec!["/nonexistent/otad-reboot".to_string()]);
        restarter.restart();
        assert!(!restarter.succeeded());
    }

    #[test]
    fn test_empty_command() {
        let restarter = CommandRestarter::new(Vec::new());
        restarter.restart();
        assert!(!restarter.succeeded());
    }
}
