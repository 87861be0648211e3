// THEORY:
// The `StateStore` is the single hand-off point between the sentinel and any
// out-of-process viewer. It owns three files in one directory:
//
// 1.  **LiveState** (`status.json`): the latest verdict, overwritten after every
//     successful classification. Last writer wins.
// 2.  **Frame artifact** (`current_frame.jpg`): the resized frame that verdict
//     was made from, overwritten alongside it.
// 3.  **Incident history** (`incident_log.json`): a JSON array, append-only
//     across restarts. Every append loads the whole array, pushes, and writes
//     the whole array back.
//
// Each file is written to a temporary sibling and renamed into place, so a
// reader sees either the old or the new content. The status and frame writes
// are still two separate writes: a reader may pair a frame from one iteration
// with a status from another. That window is accepted.
//
// Readers get the tolerant half of the contract: missing or half-written files
// read as "no data yet", never as an error. There is exactly one writer (the
// scheduler process); nothing here guards against concurrent writers.

use crate::core_modules::verdict::{SafetyStatus, Verdict, normalize_keys};
use crate::error::PersistenceError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub const LIVE_STATE_FILE: &str = "status.json";
pub const FRAME_FILE: &str = "current_frame.jpg";
pub const INCIDENT_LOG_FILE: &str = "incident_log.json";

/// Wall-clock format shared by incident timestamps and `LiveState::updated_at`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn local_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// The most recent analysis result, as seen by the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveState {
    pub status: SafetyStatus,
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub confidence: Option<u8>,
    /// File name of the frame artifact this verdict was made from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl LiveState {
    pub fn from_verdict(verdict: &Verdict, backend: &str) -> Self {
        Self {
            status: verdict.status(),
            issue: verdict.issue().unwrap_or_default().to_string(),
            confidence: verdict.confidence(),
            frame: Some(FRAME_FILE.to_string()),
            backend: Some(backend.to_string()),
            updated_at: Some(local_timestamp()),
        }
    }
}

/// One persisted DANGER event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentEntry {
    pub timestamp: String,
    pub issue: String,
    pub location: String,
}

impl IncidentEntry {
    pub fn now(issue: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            timestamp: local_timestamp(),
            issue: issue.into(),
            location: location.into(),
        }
    }

    /// Reads an entry through the shared key alias table, so histories written
    /// with `Time`/`Violation` style keys still load.
    fn from_value(value: Value) -> Option<Self> {
        let Value::Object(map) = value else { return None };
        let fields = normalize_keys(map);
        let text = |key: &str, default: &str| match fields.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => default.to_string(),
            Some(other) => other.to_string(),
        };
        Some(Self {
            timestamp: text("timestamp", "N/A"),
            issue: text("issue", "Unknown Issue"),
            location: text("location", ""),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    live_state_path: PathBuf,
    frame_path: PathBuf,
    incident_log_path: PathBuf,
}

impl StateStore {
    /// Uses the default file names inside `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            live_state_path: dir.join(LIVE_STATE_FILE),
            frame_path: dir.join(FRAME_FILE),
            incident_log_path: dir.join(INCIDENT_LOG_FILE),
        }
    }

    pub fn with_paths(live_state: PathBuf, frame: PathBuf, incident_log: PathBuf) -> Self {
        Self {
            live_state_path: live_state,
            frame_path: frame,
            incident_log_path: incident_log,
        }
    }

    pub fn live_state_path(&self) -> &Path {
        &self.live_state_path
    }

    pub fn frame_path(&self) -> &Path {
        &self.frame_path
    }

    pub fn incident_log_path(&self) -> &Path {
        &self.incident_log_path
    }

    // --- Writer side ---

    pub fn write_live_state(&self, state: &LiveState) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.live_state_path, &bytes)
    }

    pub fn write_frame(&self, jpeg: &[u8]) -> Result<(), PersistenceError> {
        write_atomic(&self.frame_path, jpeg)
    }

    /// Appends one entry and returns the new history length.
    ///
    /// Existing elements are written back exactly as they were read, whatever
    /// keys they use.
    pub fn append_incident(&self, entry: &IncidentEntry) -> Result<usize, PersistenceError> {
        let mut history = self.load_raw_history()?;
        history.push(serde_json::to_value(entry)?);
        let bytes = serde_json::to_vec_pretty(&history)?;
        write_atomic(&self.incident_log_path, &bytes)?;
        Ok(history.len())
    }

    fn load_raw_history(&self) -> Result<Vec<Value>, PersistenceError> {
        let bytes = match fs::read(&self.incident_log_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&self.incident_log_path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Array(items)) => Ok(items),
            _ => {
                self.quarantine_history()?;
                Ok(Vec::new())
            }
        }
    }

    /// Moves an unreadable history aside so appends can continue without
    /// destroying it.
    fn quarantine_history(&self) -> Result<(), PersistenceError> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut aside = self.incident_log_path.clone().into_os_string();
        aside.push(format!(".corrupt-{stamp}"));
        let aside = PathBuf::from(aside);
        warn!(
            path = %self.incident_log_path.display(),
            moved_to = %aside.display(),
            "incident history is not a JSON array, starting a new one"
        );
        fs::rename(&self.incident_log_path, &aside).map_err(|e| PersistenceError::io(&aside, e))
    }

    // --- Reader side ---

    /// The last written LiveState, or `None` when absent or mid-write.
    pub fn read_live_state(&self) -> Option<LiveState> {
        let bytes = fs::read(&self.live_state_path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// The last written frame artifact, or `None` when absent or empty.
    pub fn read_frame(&self) -> Option<Vec<u8>> {
        fs::read(&self.frame_path).ok().filter(|bytes| !bytes.is_empty())
    }

    /// The full incident history in insertion order. Missing or unreadable
    /// history reads as empty; elements that are not objects are skipped.
    pub fn load_incidents(&self) -> Vec<IncidentEntry> {
        let Ok(bytes) = fs::read(&self.incident_log_path) else {
            return Vec::new();
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Array(items)) => items.into_iter().filter_map(IncidentEntry::from_value).collect(),
            _ => Vec::new(),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
    }
    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|e| PersistenceError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| PersistenceError::io(path, e))
}
