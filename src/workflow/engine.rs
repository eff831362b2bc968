use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::definition::{NodeType, WorkflowDefinition, OUTCOME_FAILURE};
use crate::domain::{Bead, BeadContext, BeadPriority};
use crate::error::{ArbiterError, Result};
use crate::store::{ExecutionStore, MemoryExecutionStore};

/// Commit locks older than this are considered abandoned and stolen.
const COMMIT_LOCK_TIMEOUT_SECS: i64 = 300;

pub const ESCALATION_MAX_ATTEMPTS: &str = "max_attempts_exceeded";
pub const TIMEOUT_REASON: &str = "timeout";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

/// Per-bead workflow state. Transitions are append-only; `current_node` is
/// always a node of the definition; reaching an end node is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub bead_id: String,
    #[serde(default)]
    pub project_id: String,
    pub workflow_id: String,
    pub current_node: String,
    pub attempt_count: u32,
    pub transitions: Vec<Transition>,
    pub terminal: bool,
    /// Paused executions wait for a human decision and are neither
    /// dispatched nor timed out.
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What an `advance` call did.
#[derive(Debug)]
pub enum AdvanceOutcome {
    /// Moved to a new node; `terminal` means an end node was reached and the
    /// bead should be closed.
    Moved { to: String, terminal: bool },
    /// Failure consumed an attempt; the node will be retried.
    Retrying { attempts: u32, max_attempts: u32 },
    /// Attempts exhausted. The engine paused the execution and emitted an
    /// approval bead for the CEO; the caller persists it.
    Escalated { approval_bead: Box<Bead> },
    /// Repeat of an already-applied advance; state unchanged.
    NoOp,
}

/// Result of applying an advance to the in-memory state, before the change
/// is written through to the execution store.
struct AppliedAdvance {
    outcome: AdvanceOutcome,
    snapshot: Option<WorkflowExecution>,
    transition: Option<Transition>,
}

struct CommitLock {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// Drives beads through validated workflow definitions. The engine owns the
/// in-process execution cache and writes every state change through the
/// execution store, so a restarted process resumes in-flight workflows.
/// Shared across dispatcher loops; per-execution updates serialize on the map
/// shard and the commit-lock table has its own mutex.
pub struct WorkflowEngine {
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
    executions: DashMap<String, WorkflowExecution>,
    store: Arc<dyn ExecutionStore>,
    commit_locks: Mutex<HashMap<String, CommitLock>>,
    known_roles: HashSet<String>,
}

impl WorkflowEngine {
    pub fn new(known_roles: HashSet<String>) -> Self {
        Self::with_execution_store(known_roles, Arc::new(MemoryExecutionStore::new()))
    }

    pub fn with_execution_store(
        known_roles: HashSet<String>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            definitions: DashMap::new(),
            executions: DashMap::new(),
            store,
            commit_locks: Mutex::new(HashMap::new()),
            known_roles,
        }
    }

    /// Validates and registers a definition. Invalid definitions are refused
    /// with every failing rule reported.
    pub fn load_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate(&self.known_roles)?;
        info!(workflow = %definition.id, nodes = definition.nodes.len(), "Loaded workflow definition");
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn definition(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(workflow_id).map(|d| d.clone())
    }

    /// Repopulates the execution cache from the store, typically once per
    /// project at startup. Returns how many executions were restored.
    pub async fn restore_active(&self, project_id: &str) -> Result<usize> {
        let active = self.store.list_active_executions(project_id).await?;
        let count = active.len();
        for execution in active {
            self.executions.insert(execution.id.clone(), execution);
        }
        if count > 0 {
            info!(project = project_id, count, "Restored active workflow executions");
        }
        Ok(count)
    }

    /// Admits a bead, pinning a new execution to the start node.
    pub async fn admit(&self, bead: &mut Bead, workflow_id: &str) -> Result<String> {
        let start = {
            let definition = self
                .definitions
                .get(workflow_id)
                .ok_or_else(|| ArbiterError::WorkflowNotFound(workflow_id.to_string()))?;
            definition
                .start_node()
                .ok_or_else(|| {
                    ArbiterError::WorkflowValidation("definition has no start node".into())
                })?
                .id
                .clone()
        };

        let now = Utc::now();
        let execution = WorkflowExecution {
            id: format!("exec-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            bead_id: bead.id.clone(),
            project_id: bead.project_id.clone(),
            workflow_id: workflow_id.to_string(),
            current_node: start,
            attempt_count: 0,
            transitions: Vec::new(),
            terminal: false,
            paused: false,
            deadline: None,
            created_at: now,
            updated_at: now,
        };

        let execution_id = execution.id.clone();
        bead.context.workflow_execution_id = Some(execution_id.clone());
        self.executions
            .insert(execution_id.clone(), execution.clone());
        self.store.upsert_execution(execution).await?;
        info!(bead = %bead.id, workflow = workflow_id, execution = %execution_id, "Admitted bead to workflow");
        Ok(execution_id)
    }

    pub fn execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.executions.get(execution_id).map(|e| e.clone())
    }

    /// The role the dispatcher must match before handing the bead to an
    /// agent. None for start/end/merge nodes.
    pub fn required_role(&self, execution_id: &str) -> Result<Option<String>> {
        let execution = self
            .executions
            .get(execution_id)
            .ok_or_else(|| ArbiterError::ExecutionNotFound(execution_id.to_string()))?;
        let definition = self
            .definitions
            .get(&execution.workflow_id)
            .ok_or_else(|| ArbiterError::WorkflowNotFound(execution.workflow_id.clone()))?;
        Ok(definition
            .node(&execution.current_node)
            .and_then(|n| n.role.clone()))
    }

    /// Beads sitting at an approval node must not be auto-dispatched.
    pub fn is_at_approval(&self, execution_id: &str) -> bool {
        let Some(execution) = self.executions.get(execution_id) else {
            return false;
        };
        if execution.paused {
            return true;
        }
        let Some(definition) = self.definitions.get(&execution.workflow_id) else {
            return false;
        };
        definition
            .node(&execution.current_node)
            .is_some_and(|n| n.node_type == NodeType::Approval)
    }

    /// Advances an execution with an outcome, applied to the current node.
    ///
    /// Exactly one matching edge moves the bead and resets the attempt
    /// counter. A failure with no matching edge consumes an attempt and
    /// escalates once the node's budget is spent. More than one matching edge
    /// is a definition error and the call is refused.
    pub async fn advance(
        &self,
        execution_id: &str,
        outcome: &str,
        context: &BeadContext,
    ) -> Result<AdvanceOutcome> {
        let current = self
            .executions
            .get(execution_id)
            .ok_or_else(|| ArbiterError::ExecutionNotFound(execution_id.to_string()))?
            .current_node
            .clone();
        self.advance_at(execution_id, &current, outcome, context, Utc::now())
            .await
    }

    /// Advance as observed from a specific node. Callers that may redeliver
    /// an outcome (network retries, crash recovery) use this form: if the
    /// observed node was already left via the same outcome, the call is a
    /// no-op instead of double-advancing.
    pub async fn advance_from(
        &self,
        execution_id: &str,
        observed_node: &str,
        outcome: &str,
        context: &BeadContext,
    ) -> Result<AdvanceOutcome> {
        self.advance_at(execution_id, observed_node, outcome, context, Utc::now())
            .await
    }

    async fn advance_at(
        &self,
        execution_id: &str,
        observed_node: &str,
        outcome: &str,
        context: &BeadContext,
        now: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        let applied = self.apply_advance(execution_id, observed_node, outcome, context, now)?;

        // The cache mutation is done; write the new state through. A storage
        // failure surfaces upward so the caller can redispatch.
        if let Some(snapshot) = applied.snapshot {
            if let Some(transition) = applied.transition {
                self.store
                    .append_transition(&snapshot.id, transition)
                    .await?;
            }
            self.store.upsert_execution(snapshot).await?;
        }

        Ok(applied.outcome)
    }

    /// Mutates the in-memory execution under its map shard lock. Returns the
    /// snapshot to persist; `None` means nothing changed.
    fn apply_advance(
        &self,
        execution_id: &str,
        observed_node: &str,
        outcome: &str,
        context: &BeadContext,
        now: DateTime<Utc>,
    ) -> Result<AppliedAdvance> {
        let mut execution = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| ArbiterError::ExecutionNotFound(execution_id.to_string()))?;

        if observed_node != execution.current_node {
            // Redelivery of an advance that already applied
            if execution
                .transitions
                .last()
                .is_some_and(|t| t.from == observed_node && t.outcome == outcome)
            {
                return Ok(AppliedAdvance {
                    outcome: AdvanceOutcome::NoOp,
                    snapshot: None,
                    transition: None,
                });
            }
            return Err(ArbiterError::NoMatchingEdge {
                node: observed_node.to_string(),
                outcome: outcome.to_string(),
            });
        }

        if execution.terminal {
            return Err(ArbiterError::ExecutionTerminal {
                execution_id: execution_id.to_string(),
            });
        }

        let definition = self
            .definitions
            .get(&execution.workflow_id)
            .ok_or_else(|| ArbiterError::WorkflowNotFound(execution.workflow_id.clone()))?
            .clone();

        let current = execution.current_node.clone();
        let matching: Vec<_> = definition
            .edges_from(&current)
            .filter(|e| e.outcome == outcome)
            .filter(|e| e.condition.as_ref().is_none_or(|c| c.evaluate(context)))
            .collect();

        match matching.len() {
            1 => {
                let target = matching[0].to.clone();
                let node = definition.node(&target).ok_or_else(|| {
                    ArbiterError::WorkflowValidation(format!("edge targets unknown node {}", target))
                })?;
                let terminal = node.node_type == NodeType::End;

                let transition = Transition {
                    from: current.clone(),
                    to: target.clone(),
                    outcome: outcome.to_string(),
                    at: now,
                };
                execution.transitions.push(transition.clone());
                execution.current_node = target.clone();
                execution.attempt_count = 0;
                execution.terminal = terminal;
                execution.deadline = node.timeout_s.map(|s| now + Duration::seconds(s as i64));
                execution.updated_at = now;

                info!(
                    execution = execution_id,
                    from = %current,
                    to = %target,
                    outcome = outcome,
                    "Workflow transition"
                );
                Ok(AppliedAdvance {
                    outcome: AdvanceOutcome::Moved { to: target, terminal },
                    snapshot: Some(execution.clone()),
                    transition: Some(transition),
                })
            }
            0 if outcome == OUTCOME_FAILURE => {
                let node = definition.node(&current).ok_or_else(|| {
                    ArbiterError::WorkflowValidation(format!("unknown current node {}", current))
                })?;
                execution.attempt_count += 1;
                execution.updated_at = now;
                // Each retry gets a fresh per-attempt deadline
                execution.deadline = node.timeout_s.map(|s| now + Duration::seconds(s as i64));

                let outcome = if execution.attempt_count >= node.max_attempts {
                    execution.paused = true;
                    execution.deadline = None;
                    let approval_bead = build_escalation_bead(&execution, context, outcome);
                    warn!(
                        execution = execution_id,
                        node = %current,
                        attempts = execution.attempt_count,
                        "Max attempts exceeded, escalating to CEO"
                    );
                    AdvanceOutcome::Escalated {
                        approval_bead: Box::new(approval_bead),
                    }
                } else {
                    AdvanceOutcome::Retrying {
                        attempts: execution.attempt_count,
                        max_attempts: node.max_attempts,
                    }
                };
                Ok(AppliedAdvance {
                    outcome,
                    snapshot: Some(execution.clone()),
                    transition: None,
                })
            }
            0 => Err(ArbiterError::NoMatchingEdge {
                node: current,
                outcome: outcome.to_string(),
            }),
            matches => Err(ArbiterError::AmbiguousTransition {
                node: current,
                outcome: outcome.to_string(),
                matches,
            }),
        }
    }

    /// Sweeps executions whose per-attempt deadline has passed and
    /// synthesizes a failure for each. Returns what each synthesized advance
    /// did so the dispatcher can persist escalation beads.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<(String, AdvanceOutcome)> {
        let overdue: Vec<(String, String, String)> = self
            .executions
            .iter()
            .filter(|e| !e.terminal && !e.paused)
            .filter(|e| e.deadline.is_some_and(|d| now >= d))
            .map(|e| (e.id.clone(), e.bead_id.clone(), e.current_node.clone()))
            .collect();

        let mut results = Vec::new();
        for (execution_id, bead_id, node) in overdue {
            let context = BeadContext {
                escalation_reason: Some(TIMEOUT_REASON.to_string()),
                ..Default::default()
            };
            warn!(execution = %execution_id, bead = %bead_id, "Attempt deadline passed, synthesizing failure");
            match self
                .advance_at(&execution_id, &node, OUTCOME_FAILURE, &context, now)
                .await
            {
                Ok(outcome) => results.push((execution_id, outcome)),
                Err(e) => warn!(execution = %execution_id, error = %e, "Timeout advance failed"),
            }
        }
        results
    }

    /// Resumes a paused execution after a human decision, resetting the
    /// attempt budget for the current node.
    pub async fn resume(&self, execution_id: &str) -> Result<()> {
        let snapshot = {
            let mut execution = self
                .executions
                .get_mut(execution_id)
                .ok_or_else(|| ArbiterError::ExecutionNotFound(execution_id.to_string()))?;
            execution.paused = false;
            execution.attempt_count = 0;
            execution.updated_at = Utc::now();
            execution.clone()
        };
        self.store.upsert_execution(snapshot).await
    }

    /// Evicts a terminal execution from the cache, returning its final
    /// state. The store keeps the terminal snapshot as the archive.
    pub fn archive(&self, execution_id: &str) -> Option<WorkflowExecution> {
        let terminal = self
            .executions
            .get(execution_id)
            .map(|e| e.terminal)
            .unwrap_or(false);
        if terminal {
            self.executions.remove(execution_id).map(|(_, e)| e)
        } else {
            None
        }
    }

    pub fn active_executions(&self) -> Vec<WorkflowExecution> {
        self.executions
            .iter()
            .filter(|e| !e.terminal)
            .map(|e| e.clone())
            .collect()
    }

    // ---- Commit serialization ----

    /// Acquires the project-wide commit lock for a serialized node. Locks
    /// held longer than five minutes are stolen to prevent livelock.
    pub fn acquire_commit_lock(&self, project_id: &str, execution_id: &str) -> bool {
        self.acquire_commit_lock_at(project_id, execution_id, Utc::now())
    }

    fn acquire_commit_lock_at(
        &self,
        project_id: &str,
        execution_id: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let mut locks = self.commit_locks.lock();
        match locks.get(project_id) {
            Some(lock) if lock.holder == execution_id => true,
            Some(lock)
                if now.signed_duration_since(lock.acquired_at)
                    < Duration::seconds(COMMIT_LOCK_TIMEOUT_SECS) =>
            {
                false
            }
            stale => {
                if stale.is_some() {
                    warn!(project = project_id, "Stealing stale commit lock");
                }
                locks.insert(
                    project_id.to_string(),
                    CommitLock {
                        holder: execution_id.to_string(),
                        acquired_at: now,
                    },
                );
                true
            }
        }
    }

    pub fn release_commit_lock(&self, project_id: &str, execution_id: &str) {
        let mut locks = self.commit_locks.lock();
        if locks
            .get(project_id)
            .is_some_and(|l| l.holder == execution_id)
        {
            locks.remove(project_id);
        }
    }
}

fn build_escalation_bead(
    execution: &WorkflowExecution,
    context: &BeadContext,
    last_outcome: &str,
) -> Bead {
    let mut bead = Bead::new(
        format!("CEO approval required for {}", execution.bead_id),
        format!(
            "Node {} of workflow {} exhausted its attempt budget. A human decision is required before the bead can continue.",
            execution.current_node, execution.workflow_id
        ),
        BeadPriority::P1,
        "approval",
    );
    bead.context.escalation_reason = Some(ESCALATION_MAX_ATTEMPTS.to_string());
    bead.context.prior_assignee = context.prior_assignee.clone();
    bead.context
        .set_extra("attempts", execution.attempt_count.to_string());
    bead.context.set_extra("last_outcome", last_outcome);
    bead.context.set_extra("failed_node", &execution.current_node);
    bead.context.set_extra("source_bead", &execution.bead_id);
    bead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::fixtures::{bug_workflow_json, known_roles};

    fn engine_with_bug_workflow() -> WorkflowEngine {
        let engine = WorkflowEngine::new(known_roles());
        let definition = WorkflowDefinition::from_json(bug_workflow_json()).unwrap();
        engine.load_definition(definition).unwrap();
        engine
    }

    async fn admitted(engine: &WorkflowEngine) -> (Bead, String) {
        let mut bead = Bead::new("Crash on save", "", BeadPriority::P1, "bug");
        let execution_id = engine.admit(&mut bead, "auto-bug-workflow").await.unwrap();
        (bead, execution_id)
    }

    #[tokio::test]
    async fn test_admission_pins_to_start() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        let execution = engine.execution(&execution_id).unwrap();
        assert_eq!(execution.current_node, "start");
        assert_eq!(execution.attempt_count, 0);
        assert_eq!(
            bead.context.workflow_execution_id.as_deref(),
            Some(execution_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_success_path_closes_bead() {
        let engine = engine_with_bug_workflow();
        let (mut bead, execution_id) = admitted(&engine).await;

        let outcomes = ["success"; 6];
        let mut terminal = false;
        for outcome in outcomes {
            match engine
                .advance(&execution_id, outcome, &bead.context)
                .await
                .unwrap()
            {
                AdvanceOutcome::Moved { terminal: t, .. } => terminal = t,
                other => panic!("expected move, got {:?}", other),
            }
        }

        assert!(terminal);
        if terminal {
            bead.close();
        }
        assert!(bead.status.is_terminal());

        let execution = engine.execution(&execution_id).unwrap();
        assert!(execution.terminal);
        assert_eq!(execution.transitions.len(), 6);
        assert_eq!(execution.current_node, "end");
    }

    #[tokio::test]
    async fn test_approve_reject_short_circuits_to_end() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        for _ in 0..3 {
            engine
                .advance(&execution_id, "success", &bead.context)
                .await
                .unwrap();
        }
        // Now at approve; the CEO rejects
        match engine
            .advance(&execution_id, "reject", &bead.context)
            .await
            .unwrap()
        {
            AdvanceOutcome::Moved { to, terminal } => {
                assert_eq!(to, "end");
                assert!(terminal);
            }
            other => panic!("expected move, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_required_role_follows_current_node() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        assert_eq!(engine.required_role(&execution_id).unwrap(), None);
        engine
            .advance(&execution_id, "success", &bead.context)
            .await
            .unwrap();
        assert_eq!(
            engine.required_role(&execution_id).unwrap().as_deref(),
            Some("qa-engineer")
        );
    }

    #[tokio::test]
    async fn test_failure_retries_then_escalates() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        // Walk to apply (max_attempts = 3)
        for _ in 0..4 {
            engine
                .advance(&execution_id, "success", &bead.context)
                .await
                .unwrap();
        }
        assert_eq!(engine.execution(&execution_id).unwrap().current_node, "apply");

        // apply has no failure edge, so failures consume attempts
        for expected in 1..=2u32 {
            match engine
                .advance(&execution_id, "failure", &bead.context)
                .await
                .unwrap()
            {
                AdvanceOutcome::Retrying { attempts, max_attempts } => {
                    assert_eq!(attempts, expected);
                    assert_eq!(max_attempts, 3);
                }
                other => panic!("expected retry, got {:?}", other),
            }
        }

        match engine
            .advance(&execution_id, "failure", &bead.context)
            .await
            .unwrap()
        {
            AdvanceOutcome::Escalated { approval_bead } => {
                assert_eq!(approval_bead.bead_type, "approval");
                assert_eq!(
                    approval_bead.context.escalation_reason.as_deref(),
                    Some(ESCALATION_MAX_ATTEMPTS)
                );
                assert_eq!(approval_bead.context.get("attempts").as_deref(), Some("3"));
                assert_eq!(
                    approval_bead.context.get("last_outcome").as_deref(),
                    Some("failure")
                );
            }
            other => panic!("expected escalation, got {:?}", other),
        }

        // Escalated executions pause and stop dispatching
        assert!(engine.is_at_approval(&execution_id));
    }

    #[tokio::test]
    async fn test_verify_failure_loops_back_to_apply() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        for _ in 0..5 {
            engine
                .advance(&execution_id, "success", &bead.context)
                .await
                .unwrap();
        }
        assert_eq!(engine.execution(&execution_id).unwrap().current_node, "verify");

        match engine
            .advance(&execution_id, "failure", &bead.context)
            .await
            .unwrap()
        {
            AdvanceOutcome::Moved { to, terminal } => {
                assert_eq!(to, "apply");
                assert!(!terminal);
            }
            other => panic!("expected move back to apply, got {:?}", other),
        }
        // Attempt counter reset on node entry
        assert_eq!(engine.execution(&execution_id).unwrap().attempt_count, 0);
    }

    #[tokio::test]
    async fn test_redelivered_advance_is_noop() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        engine
            .advance(&execution_id, "success", &bead.context)
            .await
            .unwrap();
        let before = engine.execution(&execution_id).unwrap();

        // Redelivery of the start -> triage advance
        match engine
            .advance_from(&execution_id, "start", "success", &bead.context)
            .await
            .unwrap()
        {
            AdvanceOutcome::NoOp => {}
            other => panic!("expected no-op for redelivered advance, got {:?}", other),
        }

        let after = engine.execution(&execution_id).unwrap();
        assert_eq!(before.transitions.len(), after.transitions.len());
        assert_eq!(before.current_node, after.current_node);

        // A fresh success at the current node is a real move, not a no-op
        match engine
            .advance(&execution_id, "success", &bead.context)
            .await
            .unwrap()
        {
            AdvanceOutcome::Moved { to, .. } => assert_eq!(to, "investigate"),
            other => panic!("expected move, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_advance_from_wrong_node_is_rejected() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        engine
            .advance(&execution_id, "success", &bead.context)
            .await
            .unwrap();
        // "failure" from start never happened, so this is not a redelivery
        let err = engine
            .advance_from(&execution_id, "start", "failure", &bead.context)
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::NoMatchingEdge { .. }));
    }

    #[tokio::test]
    async fn test_terminal_execution_stays_terminal() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        for _ in 0..6 {
            engine
                .advance(&execution_id, "success", &bead.context)
                .await
                .unwrap();
        }

        let err = engine
            .advance(&execution_id, "failure", &bead.context)
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::ExecutionTerminal { .. }));
    }

    #[tokio::test]
    async fn test_unmatched_non_failure_outcome_is_error() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        let err = engine
            .advance(&execution_id, "celebrate", &bead.context)
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::NoMatchingEdge { .. }));
    }

    #[tokio::test]
    async fn test_timeout_synthesizes_failure() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        // Move to triage, which carries a 300s per-attempt timeout
        engine
            .advance(&execution_id, "success", &bead.context)
            .await
            .unwrap();
        let deadline = engine.execution(&execution_id).unwrap().deadline.unwrap();

        // Nothing expires before the deadline
        assert!(engine
            .expire_overdue(deadline - Duration::seconds(1))
            .await
            .is_empty());

        // triage max_attempts = 1, so the synthesized failure escalates
        let results = engine.expire_overdue(deadline + Duration::seconds(1)).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].1, AdvanceOutcome::Escalated { .. }));
    }

    #[test]
    fn test_commit_lock_excludes_and_expires() {
        let engine = engine_with_bug_workflow();
        let now = Utc::now();

        assert!(engine.acquire_commit_lock_at("proj", "exec-a", now));
        // Re-entrant for the same holder
        assert!(engine.acquire_commit_lock_at("proj", "exec-a", now));
        // Other executions are excluded while the lock is fresh
        assert!(!engine.acquire_commit_lock_at("proj", "exec-b", now + Duration::minutes(1)));
        // After five minutes the lock is stolen
        assert!(engine.acquire_commit_lock_at("proj", "exec-b", now + Duration::minutes(6)));

        engine.release_commit_lock("proj", "exec-b");
        assert!(engine.acquire_commit_lock_at("proj", "exec-c", now + Duration::minutes(6)));
    }

    #[tokio::test]
    async fn test_resume_clears_pause_and_attempts() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        for _ in 0..4 {
            engine
                .advance(&execution_id, "success", &bead.context)
                .await
                .unwrap();
        }
        for _ in 0..3 {
            engine
                .advance(&execution_id, "failure", &bead.context)
                .await
                .unwrap();
        }
        assert!(engine.is_at_approval(&execution_id));

        engine.resume(&execution_id).await.unwrap();
        let execution = engine.execution(&execution_id).unwrap();
        assert!(!execution.paused);
        assert_eq!(execution.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_archive_only_terminal_executions() {
        let engine = engine_with_bug_workflow();
        let (bead, execution_id) = admitted(&engine).await;

        assert!(engine.archive(&execution_id).is_none());
        for _ in 0..6 {
            engine
                .advance(&execution_id, "success", &bead.context)
                .await
                .unwrap();
        }
        let archived = engine.archive(&execution_id).unwrap();
        assert!(archived.terminal);
        assert!(engine.execution(&execution_id).is_none());
    }

    #[tokio::test]
    async fn test_executions_survive_restart_through_store() {
        let store = Arc::new(MemoryExecutionStore::new());
        let definition = WorkflowDefinition::from_json(bug_workflow_json()).unwrap();

        let engine = WorkflowEngine::with_execution_store(known_roles(), store.clone());
        engine.load_definition(definition.clone()).unwrap();

        let mut bead =
            Bead::new("Crash on save", "", BeadPriority::P1, "bug").with_project("proj");
        let execution_id = engine.admit(&mut bead, "auto-bug-workflow").await.unwrap();
        for _ in 0..2 {
            engine
                .advance(&execution_id, "success", &bead.context)
                .await
                .unwrap();
        }

        // A fresh engine over the same store picks up where the old one
        // stopped
        let restarted = WorkflowEngine::with_execution_store(known_roles(), store.clone());
        restarted.load_definition(definition).unwrap();
        assert!(restarted.execution(&execution_id).is_none());

        let restored = restarted.restore_active("proj").await.unwrap();
        assert_eq!(restored, 1);
        let execution = restarted.execution(&execution_id).unwrap();
        assert_eq!(execution.current_node, "investigate");
        assert_eq!(execution.transitions.len(), 2);

        // And can keep advancing it
        restarted
            .advance(&execution_id, "success", &bead.context)
            .await
            .unwrap();
        assert_eq!(
            restarted.execution(&execution_id).unwrap().current_node,
            "approve"
        );

        // The durable transition history grew append-only alongside
        assert_eq!(store.transition_log(&execution_id).len(), 3);
    }

    #[tokio::test]
    async fn test_terminal_executions_not_restored() {
        let store = Arc::new(MemoryExecutionStore::new());
        let definition = WorkflowDefinition::from_json(bug_workflow_json()).unwrap();

        let engine = WorkflowEngine::with_execution_store(known_roles(), store.clone());
        engine.load_definition(definition.clone()).unwrap();

        let mut bead =
            Bead::new("Crash on save", "", BeadPriority::P1, "bug").with_project("proj");
        let execution_id = engine.admit(&mut bead, "auto-bug-workflow").await.unwrap();
        for _ in 0..6 {
            engine
                .advance(&execution_id, "success", &bead.context)
                .await
                .unwrap();
        }
        engine.archive(&execution_id);

        let restarted = WorkflowEngine::with_execution_store(known_roles(), store);
        restarted.load_definition(definition).unwrap();
        assert_eq!(restarted.restore_active("proj").await.unwrap(), 0);
    }
}
