use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::lessons::LessonsProvider;
use super::loop_detector::LoopDetector;
use crate::agent::AgentRegistry;
use crate::cache::{request_fingerprint, EntryMetadata, ResponseCache};
use crate::domain::{ActionRecord, Bead, BeadStatus};
use crate::error::{ArbiterError, ProviderError, Result};
use crate::memory::{ActionEntry, LessonExtractor};
use crate::notification::{Notification, SubscriberHub};
use crate::provider::{
    ChatMessage, ChatProvider, ChatRequest, ComplexityEstimator, ProviderScorer, StreamChunk,
};
use crate::store::{BeadStore, LogStore, RequestLog};
use crate::workflow::{AdvanceOutcome, WorkflowEngine, OUTCOME_FAILURE, OUTCOME_SUCCESS};

/// Consecutive unparseable responses tolerated before the node fails.
const MAX_PARSE_FAILURES: u32 = 3;
/// How long an authentication failure keeps a provider out of rotation.
const AUTH_UNHEALTHY_MINUTES: i64 = 5;
/// Lessons injected per prompt.
const LESSON_TOP_K: usize = 5;
/// Cache lifetime for completed responses.
const CACHE_TTL_HOURS: i64 = 1;

/// Next action decoded from an agent response. Agents reply with a JSON
/// object; fields beyond the action name ride along in `data`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentAction {
    pub action: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(flatten)]
    pub data: serde_json::Map<String, Value>,
}

/// What one dispatch cycle did, for logging and tests.
#[derive(Debug, Default, Clone)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub skipped: usize,
    pub completed: usize,
    pub escalated: usize,
}

/// Selects dispatchable beads, matches agents by role, invokes providers,
/// records actions, and drives the workflow engine. One instance runs one
/// loop per project; all shared state is thread-safe.
pub struct Dispatcher {
    beads: Arc<dyn BeadStore>,
    engine: Arc<WorkflowEngine>,
    agents: Arc<AgentRegistry>,
    scorer: Arc<ProviderScorer>,
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    estimator: ComplexityEstimator,
    cache: Arc<ResponseCache>,
    lessons: Arc<LessonsProvider>,
    extractor: Arc<LessonExtractor>,
    detector: LoopDetector,
    hub: Arc<SubscriberHub>,
    logs: Arc<dyn LogStore>,
    backoff: Backoff,
    max_cost_per_mtoken: Option<f64>,
    parse_failures: DashMap<String, u32>,
    retry_attempts: DashMap<String, u32>,
}

#[allow(clippy::too_many_arguments)]
impl Dispatcher {
    pub fn new(
        beads: Arc<dyn BeadStore>,
        engine: Arc<WorkflowEngine>,
        agents: Arc<AgentRegistry>,
        scorer: Arc<ProviderScorer>,
        providers: Vec<Arc<dyn ChatProvider>>,
        cache: Arc<ResponseCache>,
        lessons: Arc<LessonsProvider>,
        extractor: Arc<LessonExtractor>,
        hub: Arc<SubscriberHub>,
        logs: Arc<dyn LogStore>,
    ) -> Self {
        let provider_map: HashMap<String, Arc<dyn ChatProvider>> = providers
            .into_iter()
            .map(|p| (p.spec().id.clone(), p))
            .collect();
        for provider in provider_map.values() {
            let spec = provider.spec();
            scorer.register(&spec.id, spec.params_b, spec.cost_per_mtoken);
        }

        Self {
            beads,
            engine,
            agents,
            scorer,
            providers: provider_map,
            estimator: ComplexityEstimator::new(),
            cache,
            lessons,
            extractor,
            detector: LoopDetector::new(),
            hub,
            logs,
            backoff: Backoff::default(),
            max_cost_per_mtoken: None,
            parse_failures: DashMap::new(),
            retry_attempts: DashMap::new(),
        }
    }

    pub fn with_loop_detector(mut self, detector: LoopDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_cost_budget(mut self, max_cost_per_mtoken: f64) -> Self {
        self.max_cost_per_mtoken = Some(max_cost_per_mtoken);
        self
    }

    /// Creates a bead and admits it into a workflow in one step.
    pub async fn admit_bead(&self, mut bead: Bead, workflow_id: &str) -> Result<Bead> {
        self.engine.admit(&mut bead, workflow_id).await?;
        self.beads.create_bead(bead.clone()).await?;
        self.hub.broadcast(&Notification::new(
            "bead.created",
            format!("Bead created: {}", bead.title),
            bead.id.clone(),
        ));
        Ok(bead)
    }

    /// One dispatch cycle for a project: sweep timeouts, select ready beads
    /// in priority order, and run each through a single agent turn.
    /// Cancellation is observed between beads.
    pub async fn dispatch_once(
        &self,
        cancel: &CancellationToken,
        project_id: &str,
    ) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        self.sweep_timeouts(project_id, &mut report).await;

        let mut candidates = self.dispatchable_beads(project_id).await?;
        candidates.sort_by(|a, b| {
            a.priority
                .code()
                .cmp(&b.priority.code())
                .then(a.created_at.cmp(&b.created_at))
        });

        for bead in candidates {
            if cancel.is_cancelled() {
                return Err(ArbiterError::Cancelled);
            }
            match self.dispatch_bead(cancel, bead, &mut report).await {
                Ok(()) => {}
                Err(ArbiterError::Cancelled) => return Err(ArbiterError::Cancelled),
                Err(e) => {
                    report.skipped += 1;
                    debug!(error = %e, "Bead skipped this cycle");
                }
            }
        }

        Ok(report)
    }

    /// Beads eligible for dispatch: open, unassigned or explicitly marked
    /// for redispatch, past any retry hold, and not parked at an approval
    /// node.
    async fn dispatchable_beads(&self, project_id: &str) -> Result<Vec<Bead>> {
        let now = Utc::now();
        let beads = self.beads.list_for_project(project_id).await?;
        Ok(beads
            .into_iter()
            .filter(|b| b.status == BeadStatus::Open)
            .filter(|b| !b.is_assigned() || b.context.redispatch_requested)
            .filter(|b| b.last_run_at.is_none_or(|t| now >= t))
            .filter(|b| {
                b.context
                    .workflow_execution_id
                    .as_deref()
                    .is_some_and(|id| !self.engine.is_at_approval(id))
            })
            .collect())
    }

    async fn sweep_timeouts(&self, project_id: &str, report: &mut DispatchReport) {
        for (execution_id, outcome) in self.engine.expire_overdue(Utc::now()).await {
            let Some(execution) = self.engine.execution(&execution_id) else {
                continue;
            };
            if let Ok(bead) = self.beads.get_bead(&execution.bead_id).await {
                if bead.project_id == project_id {
                    self.apply_advance_outcome(bead, &execution_id, outcome, "timeout", report)
                        .await;
                }
            }
        }
    }

    async fn dispatch_bead(
        &self,
        cancel: &CancellationToken,
        mut bead: Bead,
        report: &mut DispatchReport,
    ) -> Result<()> {
        let execution_id = bead
            .context
            .workflow_execution_id
            .clone()
            .ok_or_else(|| ArbiterError::Other(format!("bead {} has no workflow", bead.id)))?;

        // Pass through the start node
        let execution = self
            .engine
            .execution(&execution_id)
            .ok_or_else(|| ArbiterError::ExecutionNotFound(execution_id.clone()))?;
        let definition = self
            .engine
            .definition(&execution.workflow_id)
            .ok_or_else(|| ArbiterError::WorkflowNotFound(execution.workflow_id.clone()))?;
        if definition
            .node(&execution.current_node)
            .is_some_and(|n| n.node_type == crate::workflow::NodeType::Start)
        {
            self.engine
                .advance_from(&execution_id, &execution.current_node, OUTCOME_SUCCESS, &bead.context)
                .await?;
        }

        let execution = self
            .engine
            .execution(&execution_id)
            .ok_or_else(|| ArbiterError::ExecutionNotFound(execution_id.clone()))?;
        let current_node = execution.current_node.clone();
        let node = definition
            .node(&current_node)
            .ok_or_else(|| ArbiterError::Other(format!("unknown node {}", current_node)))?
            .clone();

        // Nodes without a role (merge, unrestricted decision) advance on
        // their own; the next cycle picks up from the target node
        let Some(role) = node.role.clone() else {
            let outcome = self
                .engine
                .advance_from(&execution_id, &current_node, OUTCOME_SUCCESS, &bead.context)
                .await?;
            self.apply_advance_outcome(bead, &execution_id, outcome, "", report)
                .await;
            return Ok(());
        };
        let available = self.agents.available_with_role(&role);
        let Some(agent_id) = available.into_iter().next() else {
            return Err(ArbiterError::NoAgentAvailable {
                role,
                bead_id: bead.id.clone(),
            });
        };

        if !self.agents.begin_work(&agent_id) {
            return Err(ArbiterError::NoAgentAvailable {
                role,
                bead_id: bead.id.clone(),
            });
        }

        // Commit-serialized nodes take the project lock for the duration of
        // the attempt
        if node.serialize
            && !self
                .engine
                .acquire_commit_lock(&bead.project_id, &execution_id)
        {
            debug!(bead = %bead.id, "Commit lock busy, deferring");
            self.agents.finish_work(&agent_id);
            return Ok(());
        }

        let result = self
            .run_agent_turn(cancel, &mut bead, &execution_id, &current_node, &agent_id, report)
            .await;

        self.agents.finish_work(&agent_id);
        if node.serialize {
            self.engine
                .release_commit_lock(&bead.project_id, &execution_id);
        }

        result
    }

    async fn run_agent_turn(
        &self,
        cancel: &CancellationToken,
        bead: &mut Bead,
        execution_id: &str,
        current_node: &str,
        agent_id: &str,
        report: &mut DispatchReport,
    ) -> Result<()> {
        let complexity =
            self.estimator
                .estimate_for_bead(&bead.bead_type, &bead.title, &bead.description);

        let provider_ids: Vec<String> = self.providers.keys().cloned().collect();
        let ranked = self.scorer.rank_for_complexity(&provider_ids, complexity);

        bead.assigned_to = agent_id.to_string();
        bead.last_run_at = None;
        // Consumed here; the flag reaches the store with the turn's outcome,
        // so a turn that dies early leaves the bead eligible for retry
        bead.context.redispatch_requested = false;

        let persona = self
            .agents
            .persona(agent_id)
            .ok_or_else(|| ArbiterError::Other(format!("unknown agent {}", agent_id)))?;
        let lessons_block = self
            .lessons
            .relevant_lessons(&bead.project_id, &bead.task_context(), LESSON_TOP_K)
            .await;
        let request_template = build_request(&persona.base_prompt, &lessons_block, bead);

        let mut last_error: Option<ProviderError> = None;
        for provider_id in &ranked {
            if !self.scorer.is_healthy(provider_id) {
                continue;
            }
            let Some(provider) = self.providers.get(provider_id) else {
                continue;
            };
            if let Some(budget) = self.max_cost_per_mtoken {
                if provider.spec().cost_per_mtoken > budget {
                    debug!(provider = %provider_id, "Provider over cost budget, skipping");
                    continue;
                }
            }

            let mut request = request_template.clone();
            request.model = provider.spec().model.clone();

            match self
                .invoke_provider(cancel, provider.as_ref(), &request, bead)
                .await
            {
                Ok(content) => {
                    report.dispatched += 1;
                    info!(bead = %bead.id, provider = %provider_id, complexity = %complexity, "Dispatched");
                    return self
                        .handle_agent_response(bead, execution_id, current_node, agent_id, &content, report)
                        .await;
                }
                Err(e) if e.is_auth() => {
                    self.scorer
                        .mark_unhealthy(provider_id, ChronoDuration::minutes(AUTH_UNHEALTHY_MINUTES));
                    last_error = Some(e);
                    continue;
                }
                Err(e) if e.is_context_length() => {
                    // Trim the prompt once: drop lessons, truncate description
                    let mut trimmed = build_request("", "", bead);
                    trimmed.model = provider.spec().model.clone();
                    trimmed.messages = trim_messages(trimmed.messages);
                    match self
                        .invoke_provider(cancel, provider.as_ref(), &trimmed, bead)
                        .await
                    {
                        Ok(content) => {
                            report.dispatched += 1;
                            return self
                                .handle_agent_response(
                                    bead, execution_id, current_node, agent_id, &content, report,
                                )
                                .await;
                        }
                        Err(_) => {
                            bead.context.escalation_reason = Some("context_length".to_string());
                            let outcome = self
                                .engine
                                .advance_from(
                                    execution_id,
                                    current_node,
                                    OUTCOME_FAILURE,
                                    &bead.context,
                                )
                                .await?;
                            self.apply_advance_outcome(
                                bead.clone(),
                                execution_id,
                                outcome,
                                "context_length",
                                report,
                            )
                            .await;
                            return Ok(());
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    // Do not advance the workflow; retry with backoff
                    let attempt = {
                        let mut entry = self.retry_attempts.entry(bead.id.clone()).or_insert(0);
                        let current = *entry;
                        *entry += 1;
                        current
                    };
                    let delay = self.backoff.delay(attempt).max(e.suggested_delay());
                    bead.context.redispatch_requested = true;
                    bead.last_run_at =
                        Some(Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64));
                    self.beads.update_bead(bead.clone()).await?;
                    warn!(bead = %bead.id, provider = %provider_id, delay_ms = delay.as_millis() as u64, error = %e, "Transient provider error, backing off");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            }
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Err(ArbiterError::NoProviderAvailable(complexity.to_string())),
        }
    }

    /// Streams one completion, consulting the response cache first. Returns
    /// the full assistant text.
    async fn invoke_provider(
        &self,
        cancel: &CancellationToken,
        provider: &dyn ChatProvider,
        request: &ChatRequest,
        bead: &Bead,
    ) -> std::result::Result<String, ProviderError> {
        let fingerprint = request_fingerprint(request);
        if let Some(entry) = self.cache.get(&fingerprint) {
            debug!(bead = %bead.id, "Cache hit");
            return Ok(entry.response.content().unwrap_or_default().to_string());
        }

        let spec = provider.spec().clone();
        let started = Instant::now();

        let mut accumulated = String::new();
        let hub = self.hub.clone();
        let bead_id = bead.id.clone();
        let mut handler = |chunk: &StreamChunk| -> std::result::Result<(), String> {
            if let Some(delta) = chunk.content() {
                accumulated.push_str(delta);
                hub.broadcast_to(
                    &bead_id,
                    &Notification::new("bead.stream", "", delta.to_string()),
                );
            }
            Ok(())
        };

        let stream_result = provider.stream(request, cancel, &mut handler).await;
        let latency_ms = started.elapsed().as_millis() as f64;
        let errored = stream_result.is_err();
        self.scorer.record_response(&spec.id, latency_ms, errored);

        let status = match &stream_result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.to_string(),
        };
        let total_tokens = (accumulated.len() / 4) as u64;
        let log = RequestLog {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: bead.assigned_to.clone(),
            provider_id: spec.id.clone(),
            model: spec.model.clone(),
            prompt_tokens: 0,
            completion_tokens: total_tokens,
            total_tokens,
            latency_ms: latency_ms as u64,
            status,
            created_at: Utc::now(),
        };
        if let Err(e) = self.logs.save_log(log).await {
            warn!(error = %e, "Failed to persist request log");
        }

        stream_result?;

        let response = synthesized_response(&spec.model, &accumulated, total_tokens);
        if let Err(e) = self.cache.set(
            &fingerprint,
            response,
            ChronoDuration::hours(CACHE_TTL_HOURS),
            EntryMetadata {
                provider_id: spec.id.clone(),
                model: spec.model.clone(),
                total_tokens,
            },
        ) {
            debug!(error = %e, "Response not cached");
        }

        Ok(accumulated)
    }

    async fn handle_agent_response(
        &self,
        bead: &mut Bead,
        execution_id: &str,
        current_node: &str,
        agent_id: &str,
        content: &str,
        report: &mut DispatchReport,
    ) -> Result<()> {
        let action = match parse_action(content) {
            Ok(action) => {
                self.parse_failures.remove(&bead.id);
                action
            }
            Err(_) => {
                let failures = {
                    let mut entry = self.parse_failures.entry(bead.id.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if failures >= MAX_PARSE_FAILURES {
                    self.parse_failures.remove(&bead.id);
                    bead.context.escalation_reason = Some("parse_failures".to_string());
                    let outcome = self
                        .engine
                        .advance_from(execution_id, current_node, OUTCOME_FAILURE, &bead.context)
                        .await?;
                    self.apply_advance_outcome(
                        bead.clone(),
                        execution_id,
                        outcome,
                        "parse_failures",
                        report,
                    )
                    .await;
                } else {
                    bead.context.redispatch_requested = true;
                    bead.last_run_at = None;
                    self.beads.update_bead(bead.clone()).await?;
                }
                return Ok(());
            }
        };

        let mut record = ActionRecord::new(agent_id, &action.action);
        record.action_data = action.data.clone();
        self.detector.record_action(bead, record);
        self.retry_attempts.remove(&bead.id);

        let (stuck, reason) = self.detector.is_stuck_in_loop(bead);
        if stuck {
            warn!(bead = %bead.id, reason = %reason, "Loop detected");
            bead.context.escalation_reason = Some("loop".to_string());
            let outcome = self
                .engine
                .advance_from(execution_id, current_node, OUTCOME_FAILURE, &bead.context)
                .await?;
            self.apply_advance_outcome(bead.clone(), execution_id, outcome, "loop", report)
                .await;
            return Ok(());
        }

        if action.complete {
            let outcome = self
                .engine
                .advance_from(execution_id, current_node, OUTCOME_SUCCESS, &bead.context)
                .await?;
            self.apply_advance_outcome(bead.clone(), execution_id, outcome, "", report)
                .await;
            return Ok(());
        }

        // Multi-turn continuation: the bead carries its state and is picked
        // up again next cycle
        bead.status = BeadStatus::Open;
        bead.context.redispatch_requested = true;
        bead.last_run_at = None;
        self.beads.update_bead(bead.clone()).await?;
        Ok(())
    }

    /// Persists the effects of a workflow advance: bead closure on terminal
    /// transitions, approval beads on escalation, redispatch on retry.
    async fn apply_advance_outcome(
        &self,
        mut bead: Bead,
        execution_id: &str,
        outcome: AdvanceOutcome,
        terminal_reason: &str,
        report: &mut DispatchReport,
    ) {
        match outcome {
            AdvanceOutcome::Moved { terminal, .. } => {
                if terminal {
                    bead.close();
                    report.completed += 1;
                    self.extract_lessons(&bead, terminal_reason).await;
                    self.engine.archive(execution_id);
                    self.hub.broadcast(&Notification::new(
                        "bead.closed",
                        format!("Bead closed: {}", bead.title),
                        bead.id.clone(),
                    ));
                } else {
                    bead.context.redispatch_requested = true;
                    bead.last_run_at = None;
                }
                if let Err(e) = self.beads.update_bead(bead).await {
                    warn!(error = %e, "Failed to persist bead after transition");
                }
            }
            AdvanceOutcome::Retrying { attempts, max_attempts } => {
                debug!(bead = %bead.id, attempts, max_attempts, "Node retry scheduled");
                bead.context.redispatch_requested = true;
                bead.last_run_at = None;
                if let Err(e) = self.beads.update_bead(bead).await {
                    warn!(error = %e, "Failed to persist bead after retry");
                }
            }
            AdvanceOutcome::Escalated { approval_bead } => {
                report.escalated += 1;
                let mut approval = *approval_bead;
                approval.project_id = bead.project_id.clone();

                bead.context.prior_assignee = Some(bead.assigned_to.clone());
                bead.assigned_to.clear();
                self.extract_lessons(&bead, terminal_reason).await;
                if let Err(e) = self.beads.update_bead(bead).await {
                    warn!(error = %e, "Failed to persist escalated bead");
                }

                self.hub.broadcast(&Notification::new(
                    "bead.escalated",
                    format!("CEO approval required: {}", approval.title),
                    approval.id.clone(),
                ));
                if let Err(e) = self.beads.create_bead(approval).await {
                    warn!(error = %e, "Failed to persist approval bead");
                }
            }
            AdvanceOutcome::NoOp => {}
        }
    }

    async fn extract_lessons(&self, bead: &Bead, terminal_reason: &str) {
        let entries: Vec<ActionEntry> = bead
            .context
            .action_history
            .iter()
            .enumerate()
            .map(|(i, record)| ActionEntry {
                iteration: i as u32,
                action_type: record.action_type.clone(),
                status: record
                    .action_data
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("ok")
                    .to_string(),
                message: record
                    .action_data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                path: record
                    .action_data
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect();

        self.extractor
            .extract_from_run(&bead.project_id, &bead.id, &entries, terminal_reason)
            .await;
    }
}

fn build_request(base_prompt: &str, lessons_block: &str, bead: &Bead) -> ChatRequest {
    let mut system = String::new();
    if !base_prompt.is_empty() {
        system.push_str(base_prompt);
        system.push_str("\n\n");
    }
    if !lessons_block.is_empty() {
        system.push_str(lessons_block);
        system.push('\n');
    }
    system.push_str(
        "Respond with a single JSON object describing your next action, e.g. \
         {\"action\":\"read_file\",\"file_path\":\"src/main.rs\"}. \
         Set \"complete\": true when the task is finished.",
    );

    let mut user = format!("# {}\n\n{}", bead.title, bead.description);
    if let Some(reason) = &bead.context.escalation_reason {
        user.push_str(&format!("\n\nPrior escalation reason: {}", reason));
    }
    if bead.context.progress_metrics.last_progress.is_some() {
        user.push_str(&format!(
            "\n\nProgress so far: {}",
            bead.context.progress_metrics.summary()
        ));
    }

    let mut request = ChatRequest::new(
        String::new(),
        vec![ChatMessage::system(system), ChatMessage::user(user)],
    );
    request.temperature = Some(0.2);
    request.stream = true;
    request
}

fn trim_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .map(|mut m| {
            if m.content.len() > 4000 {
                m.content.truncate(4000);
            }
            m
        })
        .collect()
}

/// Extracts the first JSON object from the response text. Agents often wrap
/// the object in prose or code fences.
pub fn parse_action(content: &str) -> Result<AgentAction> {
    let start = content
        .find('{')
        .ok_or_else(|| ArbiterError::ActionParse("no JSON object in response".to_string()))?;
    let end = content
        .rfind('}')
        .ok_or_else(|| ArbiterError::ActionParse("unterminated JSON object".to_string()))?;
    if end < start {
        return Err(ArbiterError::ActionParse("malformed JSON object".to_string()));
    }

    serde_json::from_str(&content[start..=end])
        .map_err(|e| ArbiterError::ActionParse(e.to_string()))
}

fn synthesized_response(model: &str, content: &str, total_tokens: u64) -> crate::provider::ChatResponse {
    crate::provider::ChatResponse {
        id: format!("resp-{}", uuid::Uuid::new_v4()),
        model: model.to_string(),
        choices: vec![crate::provider::ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: content.to_string(),
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: crate::provider::Usage {
            prompt_tokens: 0,
            completion_tokens: total_tokens,
            total_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action_plain_json() {
        let action =
            parse_action(r#"{"action":"read_file","file_path":"src/main.rs"}"#).unwrap();
        assert_eq!(action.action, "read_file");
        assert_eq!(
            action.data.get("file_path").and_then(|v| v.as_str()),
            Some("src/main.rs")
        );
        assert!(!action.complete);
    }

    #[test]
    fn test_parse_action_with_surrounding_prose() {
        let content = "I'll read the file first.\n```json\n{\"action\":\"read_file\",\"file_path\":\"a.rs\"}\n```";
        let action = parse_action(content).unwrap();
        assert_eq!(action.action, "read_file");
    }

    #[test]
    fn test_parse_action_complete_flag() {
        let action = parse_action(
            r#"{"action":"done","complete":true,"summary":"Fixed the off-by-one"}"#,
        )
        .unwrap();
        assert!(action.complete);
        assert_eq!(action.summary, "Fixed the off-by-one");
    }

    #[test]
    fn test_parse_action_rejects_prose() {
        assert!(parse_action("I could not decide what to do next.").is_err());
        assert!(parse_action("{ not json").is_err());
    }
}
