//! Notifier backends: spoken greeting through an external TTS program, or a
//! log line when no speech program is configured.

use crate::dispatch::{Notifier, NotifyError};
use std::process::{Command, Stdio};

/// Fill the `{name}` placeholder of a greeting template.
pub fn render_greeting(template: &str, name: &str) -> String {
    template.replace("{name}", name)
}

/// Speaks the greeting by running `<program> <text>` and waiting for it.
pub struct SpeechNotifier {
    program: String,
    template: String,
}

impl SpeechNotifier {
    pub fn new(program: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            template: template.into(),
        }
    }
}

impl Notifier for SpeechNotifier {
    fn announce(&mut self, name: &str) -> Result<(), NotifyError> {
        let text = render_greeting(&self.template, name);
        tracing::info!(program = %self.program, text = %text, "speaking greeting");

        let status = Command::new(&self.program)
            .arg(&text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|source| NotifyError::Spawn {
                command: self.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(NotifyError::CommandFailed {
                command: self.program.clone(),
                status: status.to_string(),
            })
        }
    }
}

/// Logs the greeting; used when speech is disabled.
pub struct LogNotifier {
    template: String,
}

impl LogNotifier {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl Notifier for LogNotifier {
    fn announce(&mut self, name: &str) -> Result<(), NotifyError> {
        tracing::info!(name, greeting = %render_greeting(&self.template, name), "greeting");
        Ok(())
    }
}

/// Speech when a program is configured, otherwise log-only.
pub fn from_config(speech_command: &str, template: &str) -> Box<dyn Notifier> {
    if speech_command.trim().is_empty() {
        tracing::info!("speech disabled; greetings go to the log");
        Box::new(LogNotifier::new(template))
    } else {
        Box::new(SpeechNotifier::new(speech_command.trim(), template))
    }
}
