//! Delivery of user-visible notifications through an external command.

use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Placeholder replaced by the notification text
pub const MESSAGE_PLACEHOLDER: &str = "%m";

/// Receives notification text. Implementations must not block the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Runs a command line such as `notify-send %m` for every notification
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    template: Vec<String>,
}

impl CommandNotifier {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Program and arguments with the placeholder substituted
    pub fn command_line(&self, message: &str) -> Vec<String> {
        self.template
            .iter()
            .map(|arg| arg.replace(MESSAGE_PLACEHOLDER, message))
            .collect()
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, message: &str) {
        info!("Notification: {}", message);

        let argv = self.command_line(message);
        let Some((program, args)) = argv.split_first() else {
            warn!("Notify command is empty, dropping notification");
            return;
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // the child starts here so it runs even if the runtime stops right after
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to run {}: {}", program, e);
                return;
            }
        };

        let program = program.clone();
        // exit status is only logged
        tokio::spawn(async move {
            match child.wait_with_output().await {
                Ok(output) => {
                    if output.status.success() {
                        debug!("Successfully sent notification via {}", program);
                    } else {
                        error!("{} exited with {}", program, output.status);
                    }
                    if !output.stdout.is_empty() {
                        info!("{} stdout: {}", program, String::from_utf8_lossy(&output.stdout));
                    }
                    if !output.stderr.is_empty() {
                        warn!("{} stderr: {}", program, String::from_utf8_lossy(&output.stderr));
                    }
                }
                Err(e) => error!("Failed waiting for {}: {}", program, e),
            }
        });
    }
}

/// Human-readable notification text for one chat line. `prefix` and `message`
/// are expected to be free of formatting codes already.
pub fn format_line(buffer: &str, prefix: &str, message: &str) -> String {
    if prefix.is_empty() {
        format!("{}: {}", buffer, message)
    } else {
        format!("{}: {} {}", buffer, prefix, message)
    }
}

#[cfg(test)]
pub mod testing {
    use super::Notifier;
    use std::sync::{Arc, Mutex};

    /// Notifier that records every message it receives
    #[derive(Debug, Clone, Default)]
    pub struct RecordingNotifier {
        messages: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingNotifier {
        pub fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }
}
