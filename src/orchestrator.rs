use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{AgentRegistry, Persona};
use crate::cache::ResponseCache;
use crate::config::ArbiterConfig;
use crate::dispatch::{Dispatcher, LessonsProvider};
use crate::domain::BeadStatus;
use crate::error::Result;
use crate::memory::{FallbackEmbedder, LessonExtractor, MemoryLessonStore};
use crate::notification::SubscriberHub;
use crate::provider::{ChatProvider, OpenAiClient, ProviderScorer, ProviderSpec};
use crate::security::CredentialStore;
use crate::store::{
    BeadStore, FileDefinitionStore, MemoryBeadStore, MemoryExecutionStore, MemoryLogStore,
};
use crate::workflow::WorkflowEngine;

/// Roles an automated persona can hold. The CEO role exists in every role
/// set but is never dispatched; approval nodes wait for a human.
const CEO_ROLE: &str = "ceo";

/// Wires configuration into the running system: stores, cache, scorer,
/// engine, dispatcher, and one dispatch loop per project.
pub struct Orchestrator {
    config: ArbiterConfig,
    beads: Arc<dyn BeadStore>,
    dispatcher: Arc<Dispatcher>,
    engine: Arc<WorkflowEngine>,
    hub: Arc<SubscriberHub>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub async fn from_config(config: ArbiterConfig) -> Result<Self> {
        let registry = Arc::new(AgentRegistry::new());
        for persona in default_personas(config.agents.max_concurrent_per_persona) {
            registry.register(persona);
        }

        let mut known_roles = registry.known_roles();
        known_roles.insert(CEO_ROLE.to_string());
        let execution_store = Arc::new(MemoryExecutionStore::new());
        let engine = Arc::new(WorkflowEngine::with_execution_store(
            known_roles,
            execution_store,
        ));

        // Definitions live beside the bead store on disk
        let data_dir = config
            .beads
            .storage_path
            .parent()
            .unwrap_or(&config.beads.storage_path)
            .to_path_buf();
        let definition_store = FileDefinitionStore::new(&data_dir);
        definition_store.init().await?;
        for definition in definition_store.list().await? {
            let id = definition.id.clone();
            if let Err(e) = engine.load_definition(definition) {
                warn!(workflow = %id, error = %e, "Skipping invalid workflow definition");
            }
        }

        // Pick in-flight executions back up from the store
        for project in &config.projects {
            if let Err(e) = engine.restore_active(&project.id).await {
                warn!(project = %project.id, error = %e, "Could not restore workflow executions");
            }
        }

        let providers = build_providers(&config).await?;

        let scorer = Arc::new(ProviderScorer::new());
        let cache = Arc::new(ResponseCache::new(config.cache.max_entries));
        let hub = Arc::new(SubscriberHub::new());
        let beads: Arc<dyn BeadStore> = Arc::new(MemoryBeadStore::new());
        let logs = Arc::new(MemoryLogStore::new());

        let lesson_store = Arc::new(MemoryLessonStore::new());
        let embedder = Arc::new(FallbackEmbedder::new(None));
        let lessons = Arc::new(LessonsProvider::new(lesson_store.clone(), embedder.clone()));
        let extractor = Arc::new(LessonExtractor::new(lesson_store, embedder));

        let dispatcher = Arc::new(Dispatcher::new(
            beads.clone(),
            engine.clone(),
            registry,
            scorer,
            providers,
            cache,
            lessons,
            extractor,
            hub.clone(),
            logs,
        ));

        Ok(Self {
            config,
            beads,
            dispatcher,
            engine,
            hub,
            cancel: CancellationToken::new(),
        })
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn engine(&self) -> Arc<WorkflowEngine> {
        self.engine.clone()
    }

    pub fn hub(&self) -> Arc<SubscriberHub> {
        self.hub.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs one dispatch loop per configured project until cancelled.
    /// Non-perpetual projects stop once their backlog drains.
    pub async fn run(&self) -> Result<()> {
        let interval = Duration::from_secs(self.config.agents.heartbeat_interval_secs);
        let mut handles = Vec::new();

        for project in &self.config.projects {
            let project_id = project.id.clone();
            let is_perpetual = project.is_perpetual;
            let dispatcher = self.dispatcher.clone();
            let beads = self.beads.clone();
            let cancel = self.cancel.clone();

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    match dispatcher.dispatch_once(&cancel, &project_id).await {
                        Ok(report) => {
                            if report.dispatched > 0 || report.escalated > 0 {
                                info!(
                                    project = %project_id,
                                    dispatched = report.dispatched,
                                    completed = report.completed,
                                    escalated = report.escalated,
                                    "Dispatch cycle"
                                );
                            }
                        }
                        Err(crate::error::ArbiterError::Cancelled) => break,
                        Err(e) => error!(project = %project_id, error = %e, "Dispatch cycle failed"),
                    }

                    if !is_perpetual {
                        let open = beads
                            .list_for_project(&project_id)
                            .await
                            .map(|bs| bs.iter().any(|b| b.status != BeadStatus::Closed))
                            .unwrap_or(true);
                        if !open {
                            info!(project = %project_id, "Backlog drained, stopping project loop");
                            break;
                        }
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Stops all project loops and closes subscriber channels.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.hub.shutdown();
    }
}

async fn build_providers(config: &ArbiterConfig) -> Result<Vec<Arc<dyn ChatProvider>>> {
    let credentials = CredentialStore::open_from_env(
        config
            .beads
            .storage_path
            .parent()
            .unwrap_or(&config.beads.storage_path)
            .join("keystore.json"),
    )
    .ok();

    let mut providers: Vec<Arc<dyn ChatProvider>> = Vec::new();
    for entry in &config.providers {
        let api_key = match (&entry.key_ref, &credentials) {
            (Some(key_ref), Some(store)) => match store.get(key_ref).await {
                Ok(key) => key,
                Err(e) => {
                    warn!(provider = %entry.id, error = %e, "Could not read provider key");
                    None
                }
            },
            (Some(_), None) => {
                warn!(provider = %entry.id, "Provider declares key_ref but the credential store is locked");
                None
            }
            (None, _) => None,
        };

        providers.push(Arc::new(OpenAiClient::new(ProviderSpec {
            id: entry.id.clone(),
            endpoint: entry.endpoint.clone(),
            api_key,
            model: entry.model.clone(),
            params_b: entry.params_b,
            cost_per_mtoken: entry.cost_per_mtoken,
        })));
    }
    Ok(providers)
}

/// The built-in persona set. Matches the roles used by the stock workflow
/// definitions; operators extend this through persona files.
pub fn default_personas(max_concurrent: usize) -> Vec<Persona> {
    vec![
        Persona::new(
            "qa-1",
            &["qa-engineer"],
            "You are a QA engineer. Triage incoming defects, reproduce them, and verify fixes.",
        )
        .with_max_concurrent(max_concurrent),
        Persona::new(
            "backend-1",
            &["backend-engineer"],
            "You are a backend engineer. Investigate root causes and propose minimal fixes.",
        )
        .with_max_concurrent(max_concurrent),
        Persona::new(
            "em-1",
            &["engineering-manager"],
            "You are an engineering manager. Apply approved changes and commit them with full metadata trailers.",
        )
        .with_max_concurrent(max_concurrent),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_orchestrator_builds_from_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ArbiterConfig::default();
        config.beads.storage_path = dir.path().join("beads");

        let orchestrator = Orchestrator::from_config(config).await.unwrap();
        orchestrator.shutdown();
    }

    #[test]
    fn test_default_personas_cover_stock_roles() {
        let personas = default_personas(2);
        let roles: Vec<&str> = personas
            .iter()
            .flat_map(|p| p.roles.iter().map(|r| r.as_str()))
            .collect();
        assert!(roles.contains(&"qa-engineer"));
        assert!(roles.contains(&"backend-engineer"));
        assert!(roles.contains(&"engineering-manager"));
        assert!(personas.iter().all(|p| p.max_concurrent == 2));
    }
}
