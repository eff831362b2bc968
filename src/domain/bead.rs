use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::BeadContext;

/// Priority codes order beads within a dispatch cycle: P0 first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BeadPriority {
    P0,
    P1,
    P2,
    P3,
}

impl BeadPriority {
    pub fn code(&self) -> u8 {
        match self {
            Self::P0 => 0,
            Self::P1 => 1,
            Self::P2 => 2,
            Self::P3 => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    #[default]
    Open,
    InProgress,
    Closed,
}

impl BeadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// A unit of trackable work. Equivalent to an issue or ticket; the dispatcher
/// moves it through a workflow one agent turn at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub priority: BeadPriority,
    /// Free-form type tag: `bug`, `feature`, `design`, `chore`, ...
    pub bead_type: String,
    pub status: BeadStatus,
    #[serde(default)]
    pub assigned_to: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub context: BeadContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Bead {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        priority: BeadPriority,
        bead_type: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("bead-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            project_id: String::new(),
            title: title.into(),
            description: description.into(),
            priority,
            bead_type: bead_type.into(),
            status: BeadStatus::Open,
            assigned_to: String::new(),
            created_at: Utc::now(),
            context: BeadContext::default(),
            last_run_at: None,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn is_assigned(&self) -> bool {
        !self.assigned_to.is_empty()
    }

    pub fn close(&mut self) {
        self.status = BeadStatus::Closed;
    }

    /// Reopening keeps the accumulated context so a returning agent sees the
    /// full action history.
    pub fn reopen(&mut self) {
        self.status = BeadStatus::Open;
        self.assigned_to.clear();
    }

    /// Text used for lesson similarity search and complexity estimation.
    pub fn task_context(&self) -> String {
        format!("{} {}", self.title, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(BeadPriority::P0 < BeadPriority::P1);
        assert!(BeadPriority::P1 < BeadPriority::P3);
        assert_eq!(BeadPriority::P2.code(), 2);
    }

    #[test]
    fn test_reopen_retains_context() {
        let mut bead = Bead::new("Fix flaky test", "", BeadPriority::P2, "bug");
        bead.assigned_to = "agent-1".to_string();
        bead.context.set_extra("note", "intermittent on CI");
        bead.close();
        assert!(bead.status.is_terminal());

        bead.reopen();
        assert_eq!(bead.status, BeadStatus::Open);
        assert!(!bead.is_assigned());
        assert_eq!(bead.context.get("note").as_deref(), Some("intermittent on CI"));
    }
}
