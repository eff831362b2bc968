use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::domain::Bead;
use crate::error::{ArbiterError, Result};
use crate::workflow::{Transition, WorkflowDefinition, WorkflowExecution};

/// One provider request, persisted for audit and cost accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    pub provider_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: u64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub user_id: Option<String>,
    pub provider_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl LogFilter {
    fn matches(&self, log: &RequestLog) -> bool {
        if let Some(user) = &self.user_id {
            if &log.user_id != user {
                return false;
            }
        }
        if let Some(provider) = &self.provider_id {
            if &log.provider_id != provider {
                return false;
            }
        }
        if let Some(since) = self.since {
            if log.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if log.created_at > until {
                return false;
            }
        }
        true
    }
}

/// Request-log persistence seam. SQL backends adapt this; the in-memory
/// implementation backs tests and single-process runs.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn save_log(&self, log: RequestLog) -> Result<()>;
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RequestLog>>;
}

/// Bead persistence seam.
#[async_trait]
pub trait BeadStore: Send + Sync {
    async fn create_bead(&self, bead: Bead) -> Result<()>;
    async fn get_bead(&self, bead_id: &str) -> Result<Bead>;
    async fn update_bead(&self, bead: Bead) -> Result<()>;
    async fn list_for_project(&self, project_id: &str) -> Result<Vec<Bead>>;
}

/// Workflow execution persistence seam. The engine owns the in-process
/// execution cache and writes through this trait, so a restarted process can
/// pick up in-flight workflows where they stopped.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Non-terminal executions for a project, used to repopulate the
    /// engine's cache on startup.
    async fn list_active_executions(&self, project_id: &str) -> Result<Vec<WorkflowExecution>>;

    /// Persists the execution's current state, inserting or replacing.
    async fn upsert_execution(&self, execution: WorkflowExecution) -> Result<()>;

    /// Appends one transition to the durable per-execution history. Backends
    /// that keep transitions in a separate append-only table implement this
    /// directly; the head-state snapshot goes through `upsert_execution`.
    async fn append_transition(&self, execution_id: &str, transition: Transition) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryLogStore {
    logs: RwLock<Vec<RequestLog>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn save_log(&self, log: RequestLog) -> Result<()> {
        self.logs.write().push(log);
        Ok(())
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RequestLog>> {
        let guard = self.logs.read();
        let mut matched: Vec<RequestLog> = guard.iter().filter(|l| filter.matches(l)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

#[derive(Default)]
pub struct MemoryBeadStore {
    beads: DashMap<String, Bead>,
}

impl MemoryBeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.beads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beads.is_empty()
    }
}

#[async_trait]
impl BeadStore for MemoryBeadStore {
    async fn create_bead(&self, bead: Bead) -> Result<()> {
        self.beads.insert(bead.id.clone(), bead);
        Ok(())
    }

    async fn get_bead(&self, bead_id: &str) -> Result<Bead> {
        self.beads
            .get(bead_id)
            .map(|b| b.clone())
            .ok_or_else(|| ArbiterError::BeadNotFound(bead_id.to_string()))
    }

    async fn update_bead(&self, bead: Bead) -> Result<()> {
        if !self.beads.contains_key(&bead.id) {
            return Err(ArbiterError::BeadNotFound(bead.id));
        }
        self.beads.insert(bead.id.clone(), bead);
        Ok(())
    }

    async fn list_for_project(&self, project_id: &str) -> Result<Vec<Bead>> {
        let mut beads: Vec<Bead> = self
            .beads
            .iter()
            .filter(|b| b.project_id == project_id)
            .map(|b| b.clone())
            .collect();
        beads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(beads)
    }
}

#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: DashMap<String, WorkflowExecution>,
    transitions: DashMap<String, Vec<Transition>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The append-only transition history recorded for an execution.
    pub fn transition_log(&self, execution_id: &str) -> Vec<Transition> {
        self.transitions
            .get(execution_id)
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn list_active_executions(&self, project_id: &str) -> Result<Vec<WorkflowExecution>> {
        let mut active: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|e| !e.terminal && e.project_id == project_id)
            .map(|e| e.clone())
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn upsert_execution(&self, execution: WorkflowExecution) -> Result<()> {
        self.executions.insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn append_transition(&self, execution_id: &str, transition: Transition) -> Result<()> {
        self.transitions
            .entry(execution_id.to_string())
            .or_default()
            .push(transition);
        Ok(())
    }
}

/// Workflow definitions persisted as one JSON document per file, written
/// atomically (temp file + rename) so a crash never leaves a torn
/// definition.
pub struct FileDefinitionStore {
    definitions_dir: PathBuf,
}

impl FileDefinitionStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            definitions_dir: base_dir.join("workflows"),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.definitions_dir).await?;
        Ok(())
    }

    pub async fn save(&self, definition: &WorkflowDefinition) -> Result<()> {
        let path = self.definition_path(&definition.id);
        let content = serde_json::to_string_pretty(definition)?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &content).await?;
        fs::rename(&tmp_path, &path).await?;
        debug!(path = %path.display(), "Wrote workflow definition");
        Ok(())
    }

    pub async fn load(&self, workflow_id: &str) -> Result<WorkflowDefinition> {
        let path = self.definition_path(workflow_id);
        if !path.exists() {
            return Err(ArbiterError::WorkflowNotFound(workflow_id.to_string()));
        }
        let content = fs::read_to_string(&path).await?;
        WorkflowDefinition::from_json(&content)
    }

    pub async fn list(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut definitions = Vec::new();
        if !self.definitions_dir.exists() {
            return Ok(definitions);
        }

        let mut entries = fs::read_dir(&self.definitions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Ok(content) = fs::read_to_string(&path).await {
                    if let Ok(definition) = WorkflowDefinition::from_json(&content) {
                        definitions.push(definition);
                    }
                }
            }
        }
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    fn definition_path(&self, workflow_id: &str) -> PathBuf {
        self.definitions_dir.join(format!("{}.json", workflow_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BeadPriority;

    #[tokio::test]
    async fn test_log_filtering() {
        let store = MemoryLogStore::new();
        for (provider, user) in [("p1", "alice"), ("p1", "bob"), ("p2", "alice")] {
            store
                .save_log(RequestLog {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: user.to_string(),
                    provider_id: provider.to_string(),
                    model: "m".to_string(),
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                    latency_ms: 120,
                    status: "ok".to_string(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let filter = LogFilter {
            provider_id: Some("p1".to_string()),
            ..Default::default()
        };
        assert_eq!(store.get_logs(&filter).await.unwrap().len(), 2);

        let filter = LogFilter {
            user_id: Some("alice".to_string()),
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(store.get_logs(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bead_store_roundtrip() {
        let store = MemoryBeadStore::new();
        let bead =
            Bead::new("Fix crash", "", BeadPriority::P1, "bug").with_project("proj");
        let bead_id = bead.id.clone();
        store.create_bead(bead).await.unwrap();

        let mut loaded = store.get_bead(&bead_id).await.unwrap();
        loaded.assigned_to = "agent-1".to_string();
        store.update_bead(loaded).await.unwrap();

        let listed = store.list_for_project("proj").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].assigned_to, "agent-1");

        assert!(store.get_bead("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_execution_store_upsert_and_filtering() {
        let store = MemoryExecutionStore::new();
        let mut execution = sample_execution("exec-1", "proj");
        store.upsert_execution(execution.clone()).await.unwrap();

        let mut other = sample_execution("exec-2", "other-proj");
        store.upsert_execution(other.clone()).await.unwrap();

        let active = store.list_active_executions("proj").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "exec-1");

        // Terminal executions drop out of the active listing
        execution.terminal = true;
        store.upsert_execution(execution).await.unwrap();
        assert!(store.list_active_executions("proj").await.unwrap().is_empty());

        // Upsert replaces in place
        other.current_node = "verify".to_string();
        store.upsert_execution(other).await.unwrap();
        let active = store.list_active_executions("other-proj").await.unwrap();
        assert_eq!(active[0].current_node, "verify");
    }

    #[tokio::test]
    async fn test_transition_log_is_append_only() {
        let store = MemoryExecutionStore::new();
        store
            .upsert_execution(sample_execution("exec-1", "proj"))
            .await
            .unwrap();

        for (from, to) in [("start", "triage"), ("triage", "investigate")] {
            store
                .append_transition(
                    "exec-1",
                    Transition {
                        from: from.to_string(),
                        to: to.to_string(),
                        outcome: "success".to_string(),
                        at: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        let log = store.transition_log("exec-1");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].to, "triage");
        assert_eq!(log[1].to, "investigate");
        assert!(store.transition_log("missing").is_empty());
    }

    fn sample_execution(id: &str, project_id: &str) -> WorkflowExecution {
        let now = Utc::now();
        WorkflowExecution {
            id: id.to_string(),
            bead_id: "bead-1".to_string(),
            project_id: project_id.to_string(),
            workflow_id: "auto-bug-workflow".to_string(),
            current_node: "start".to_string(),
            attempt_count: 0,
            transitions: Vec::new(),
            terminal: false,
            paused: false,
            deadline: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_file_definition_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDefinitionStore::new(dir.path());
        store.init().await.unwrap();

        let definition = WorkflowDefinition::from_json(
            crate::workflow::definition::fixtures::bug_workflow_json(),
        )
        .unwrap();
        store.save(&definition).await.unwrap();

        let loaded = store.load("auto-bug-workflow").await.unwrap();
        assert_eq!(loaded.nodes.len(), definition.nodes.len());
        assert_eq!(store.list().await.unwrap().len(), 1);

        assert!(store.load("missing").await.is_err());
    }
}
