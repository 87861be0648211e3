use factory_sentinel::core_modules::channels::Speaker;
use factory_sentinel::error::ChannelError;
use std::process::{Command, Stdio};

pub const DEFAULT_SPEECH_COMMAND: &str = "espeak";
pub const DEFAULT_SPEECH_RATE: u32 = 150;

/// Speaks through an external text-to-speech program invoked as
/// `<program> -s <rate> -- <text>`.
#[derive(Debug, Clone)]
pub struct CommandSpeaker {
    program: String,
    rate: u32,
}

impl CommandSpeaker {
    pub fn new(program: impl Into<String>, rate: u32) -> Self {
        Self {
            program: program.into(),
            rate,
        }
    }

    fn command(&self, text: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-s")
            .arg(self.rate.to_string())
            .arg("--")
            .arg(text)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

impl Default for CommandSpeaker {
    fn default() -> Self {
        Self::new(DEFAULT_SPEECH_COMMAND, DEFAULT_SPEECH_RATE)
    }
}

impl Speaker for CommandSpeaker {
    fn speak(&self, text: &str) -> Result<(), ChannelError> {
        let status = self
            .command(text)
            .status()
            .map_err(|e| ChannelError::Speech(format!("{}: {e}", self.program)))?;
        if !status.success() {
            return Err(ChannelError::Speech(format!("{} exited with {status}", self.program)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_rate_and_text_arguments() {
        let speaker = CommandSpeaker::default();
        let command = speaker.command("Alert! Violation detected. spill");
        assert_eq!(command.get_program(), "espeak");
        let args: Vec<_> = command.get_args().collect();
        assert_eq!(args, ["-s", "150", "--", "Alert! Violation detected. spill"]);
    }

    #[test]
    fn dash_leading_text_is_not_read_as_a_flag() {
        let command = CommandSpeaker::default().command("-w out.wav");
        let args: Vec<_> = command.get_args().collect();
        assert_eq!(args, ["-s", "150", "--", "-w out.wav"]);
    }

    #[test]
    fn missing_program_is_a_speech_error() {
        let speaker = CommandSpeaker::new("definitely-not-a-tts-engine-xyz", 150);
        assert!(matches!(speaker.speak("hello"), Err(ChannelError::Speech(_))));
    }
}
