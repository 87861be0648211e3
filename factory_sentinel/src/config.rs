use crate::core_modules::dispatcher::DEFAULT_NOTIFICATION_COOLDOWN;
use crate::error::ConfigurationError;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BACKENDS: [&str; 3] = ["gemini-2.0-flash", "gemini-1.5-flash-001", "gemini-1.5-pro-001"];
pub const DEFAULT_LOCATION: &str = "Camera-01";

/// Tunable behavior of the whole sentinel. Binaries fill this from flags and
/// environment; the library only validates it.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Minimum time between two analysis submissions.
    pub analysis_interval: Duration,
    /// Upper bound on a single classifier call.
    pub classify_timeout: Duration,
    /// Pause between loop iterations when no analysis is due.
    pub frame_period: Duration,
    pub frame_width: u32,
    pub frame_height: u32,
    pub jpeg_quality: u8,
    pub notification_cooldown: Duration,
    /// Written into every incident entry.
    pub location: String,
    pub state_dir: PathBuf,
    /// Candidate backends in priority order.
    pub backends: Vec<String>,
    pub probe_backends: bool,
    pub discover_backends: bool,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        let analysis_interval = Duration::from_secs(5);
        Self {
            analysis_interval,
            classify_timeout: analysis_interval,
            frame_period: Duration::from_millis(33),
            frame_width: 640,
            frame_height: 480,
            jpeg_quality: 85,
            notification_cooldown: DEFAULT_NOTIFICATION_COOLDOWN,
            location: DEFAULT_LOCATION.to_string(),
            state_dir: PathBuf::from("."),
            backends: DEFAULT_BACKENDS.iter().map(|s| s.to_string()).collect(),
            probe_backends: true,
            discover_backends: false,
        }
    }
}

impl SentinelConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.analysis_interval.is_zero() {
            return Err(invalid("analysis_interval", "must be greater than zero"));
        }
        if self.classify_timeout.is_zero() {
            return Err(invalid("classify_timeout", "must be greater than zero"));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(invalid(
                "frame_size",
                format!("{}x{} has a zero dimension", self.frame_width, self.frame_height),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(invalid("jpeg_quality", format!("{} is outside 1-100", self.jpeg_quality)));
        }
        if self.backends.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigurationError::EmptyCatalog);
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::Invalid {
        name,
        reason: reason.into(),
    }
}
