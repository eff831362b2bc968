use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::action::{ActionRecord, ProgressMetrics};

/// Durable per-bead scratch space.
///
/// Reserved keys from the wire format are promoted to typed members; anything
/// else an agent stashes lands in `extra`. The whole struct travels with the
/// bead, so a reopened bead resumes with its full history intact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeadContext {
    pub action_history: Vec<ActionRecord>,
    pub progress_metrics: ProgressMetrics,
    pub redispatch_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_assignee: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl BeadContext {
    /// Looks up a value usable in workflow edge predicates. Reserved keys
    /// resolve to their typed members rendered as strings.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "redispatch_requested" => Some(self.redispatch_requested.to_string()),
            "workflow_execution_id" => self.workflow_execution_id.clone(),
            "escalation_reason" => self.escalation_reason.clone(),
            "prior_assignee" => self.prior_assignee.clone(),
            _ => self.extra.get(key).cloned(),
        }
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra.insert(key.into(), value.into());
    }

    /// Clears loop-detection state. Used when a bead is handed to a fresh
    /// agent after escalation so old history does not trip the detector.
    pub fn reset_progress(&mut self) {
        self.action_history.clear();
        self.progress_metrics = ProgressMetrics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_key_lookup() {
        let mut ctx = BeadContext {
            redispatch_requested: true,
            workflow_execution_id: Some("exec-1".into()),
            ..Default::default()
        };
        ctx.set_extra("branch", "main");

        assert_eq!(ctx.get("redispatch_requested").as_deref(), Some("true"));
        assert_eq!(ctx.get("workflow_execution_id").as_deref(), Some("exec-1"));
        assert_eq!(ctx.get("branch").as_deref(), Some("main"));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn test_reset_progress_clears_history_only() {
        let mut ctx = BeadContext::default();
        ctx.action_history
            .push(crate::domain::ActionRecord::new("a", "read_file"));
        ctx.progress_metrics.files_read = 3;
        ctx.set_extra("branch", "main");

        ctx.reset_progress();

        assert!(ctx.action_history.is_empty());
        assert_eq!(ctx.progress_metrics.files_read, 0);
        assert_eq!(ctx.get("branch").as_deref(), Some("main"));
    }
}
