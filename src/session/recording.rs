use super::*;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Session recording granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum SessionRecordLevel {
    /// Disable recording.
    Off,
    /// Connection, configuration, RPC and transfer events.
    KeyEventsOnly,
    /// Key events plus RPC output bodies.
    #[default]
    Full,
}

/// A single recorded session event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionRecordEntry {
    pub ts_ms: u128,
    pub event: SessionEvent,
}

/// Recorded event types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionOpened {
        host: String,
        delegated: bool,
    },
    ConnectionFailed {
        host: String,
        message: String,
    },
    ConnectionClosed {
        reason: String,
    },
    ConfigurationOpened {
        mode: ConfigMode,
        #[serde(default)]
        ephemeral_instance: Option<String>,
    },
    ConfigurationClosed {
        mode: ConfigMode,
        success: bool,
    },
    /// load, check, diff, commit or rollback.
    ConfigurationChanged {
        operation: String,
        success: bool,
        #[serde(default)]
        message: Option<String>,
    },
    RpcExecuted {
        rpc: String,
        format: RpcFormat,
        success: bool,
        message: String,
    },
    RpcOutput {
        rpc: String,
        content: String,
    },
    TransferCompleted {
        protocol: FileProtocol,
        direction: TransferDirection,
        local: String,
        remote: String,
        changed: bool,
        failed: bool,
        message: String,
    },
    RebootRequested {
        outcome: String,
        message: String,
    },
}

/// In-memory session recorder. Clones share the same log.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

fn lock_error(e: impl fmt::Display) -> DeviceError {
    DeviceError::Io(std::io::Error::other(format!("record lock error: {e}")))
}

impl SessionRecorder {
    pub fn new(level: SessionRecordLevel) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Record a key event.
    pub fn record_event(&self, event: SessionEvent) -> Result<(), DeviceError> {
        if self.level == SessionRecordLevel::Off {
            return Ok(());
        }
        let mut guard = self.entries.lock().map_err(lock_error)?;
        guard.push(SessionRecordEntry {
            ts_ms: now_ms(),
            event,
        });
        Ok(())
    }

    /// Record an RPC output body when running at [`SessionRecordLevel::Full`].
    pub fn record_output(&self, rpc: &str, content: &str) -> Result<(), DeviceError> {
        if self.level != SessionRecordLevel::Full {
            return Ok(());
        }
        self.record_event(SessionEvent::RpcOutput {
            rpc: rpc.to_string(),
            content: content.to_string(),
        })
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Result<Vec<SessionRecordEntry>, DeviceError> {
        let guard = self.entries.lock().map_err(lock_error)?;
        Ok(guard.clone())
    }

    /// Recorded events without timestamps.
    pub fn events(&self) -> Result<Vec<SessionEvent>, DeviceError> {
        Ok(self.entries()?.into_iter().map(|e| e.event).collect())
    }

    pub fn clear(&self) -> Result<(), DeviceError> {
        self.entries.lock().map_err(lock_error)?.clear();
        Ok(())
    }

    /// Export records as JSONL.
    pub fn to_jsonl(&self) -> Result<String, DeviceError> {
        let entries = self.entries()?;
        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            lines.push(serde_json::to_string(&entry)?);
        }
        Ok(lines.join("\n"))
    }

    /// Restore a recorder from JSONL lines. Blank lines are skipped.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, DeviceError> {
        let parsed = jsonl
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<SessionRecordEntry>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            level: SessionRecordLevel::Full,
            entries: Arc::new(Mutex::new(parsed)),
        })
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::Full)
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
