use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single action taken by an agent while working a bead.
///
/// `progress_key` is derived by the loop detector when the record is stored;
/// identical (action_type, primary target) pairs always produce the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub action_type: String,
    #[serde(default)]
    pub action_data: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
    #[serde(default)]
    pub progress_key: String,
}

impl ActionRecord {
    pub fn new(agent_id: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_id: agent_id.into(),
            action_type: action_type.into(),
            action_data: serde_json::Map::new(),
            result_hash: None,
            progress_key: String::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.action_data.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = at;
        self
    }

    /// The target that identifies what this action operated on: a file path
    /// for file operations, a command line for shell actions, otherwise the
    /// serialized action data.
    pub fn primary_target(&self) -> String {
        if let Some(Value::String(path)) = self.action_data.get("file_path") {
            return path.clone();
        }
        if let Some(Value::String(command)) = self.action_data.get("command") {
            return command.clone();
        }
        // serde_json::Map preserves a stable order for identical inputs
        serde_json::to_string(&self.action_data).unwrap_or_default()
    }
}

/// Progress counters for a bead, updated on every recorded action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressMetrics {
    pub files_read: u32,
    pub files_modified: u32,
    pub tests_run: u32,
    pub commands_executed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress: Option<DateTime<Utc>>,
}

impl ProgressMetrics {
    pub fn summary(&self) -> String {
        let last = match self.last_progress {
            Some(at) => {
                let elapsed = Utc::now().signed_duration_since(at);
                format!("{}s ago", elapsed.num_seconds().max(0))
            }
            None => "never".to_string(),
        };
        format!(
            "Files read: {}, modified: {}, tests: {}, commands: {} (last: {})",
            self.files_read, self.files_modified, self.tests_run, self.commands_executed, last
        )
    }
}
