use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// How much latitude an agent has before decisions route to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    Supervised,
    #[default]
    SemiAutonomous,
    Autonomous,
}

/// A persona binds a role set and base prompt to an executor identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub roles: Vec<String>,
    pub base_prompt: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub autonomy: AutonomyLevel,
}

fn default_max_concurrent() -> usize {
    1
}

impl Persona {
    pub fn new(id: impl Into<String>, roles: &[&str], base_prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            base_prompt: base_prompt.into(),
            max_concurrent: default_max_concurrent(),
            autonomy: AutonomyLevel::default(),
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Tracks registered personas and their in-flight work so the dispatcher can
/// match roles without exceeding per-agent concurrency caps.
#[derive(Default)]
pub struct AgentRegistry {
    personas: DashMap<String, Persona>,
    active: DashMap<String, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, persona: Persona) {
        self.personas.insert(persona.id.clone(), persona);
    }

    pub fn persona(&self, agent_id: &str) -> Option<Persona> {
        self.personas.get(agent_id).map(|p| p.clone())
    }

    /// Every role any registered persona can play. The workflow engine
    /// validates definitions against this set.
    pub fn known_roles(&self) -> HashSet<String> {
        self.personas
            .iter()
            .flat_map(|p| p.roles.clone())
            .collect()
    }

    /// Agents holding the role with spare concurrency.
    pub fn available_with_role(&self, role: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .personas
            .iter()
            .filter(|p| p.has_role(role))
            .filter(|p| self.active_count(&p.id) < p.max_concurrent)
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self, agent_id: &str) -> usize {
        self.active.get(agent_id).map(|c| *c).unwrap_or(0)
    }

    /// Claims a concurrency slot. Returns false when the agent is at its cap.
    pub fn begin_work(&self, agent_id: &str) -> bool {
        let Some(persona) = self.personas.get(agent_id) else {
            return false;
        };
        let mut count = self.active.entry(agent_id.to_string()).or_insert(0);
        if *count >= persona.max_concurrent {
            return false;
        }
        *count += 1;
        true
    }

    pub fn finish_work(&self, agent_id: &str) {
        if let Some(mut count) = self.active.get_mut(agent_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_matching_and_caps() {
        let registry = AgentRegistry::new();
        registry.register(
            Persona::new("qa-1", &["qa-engineer"], "You verify fixes.").with_max_concurrent(1),
        );
        registry.register(Persona::new(
            "eng-1",
            &["backend-engineer", "qa-engineer"],
            "You fix bugs.",
        ));

        let available = registry.available_with_role("qa-engineer");
        assert_eq!(available, vec!["eng-1".to_string(), "qa-1".to_string()]);

        assert!(registry.begin_work("qa-1"));
        // Cap of one: no second slot
        assert!(!registry.begin_work("qa-1"));
        assert_eq!(registry.available_with_role("qa-engineer"), vec!["eng-1".to_string()]);

        registry.finish_work("qa-1");
        assert!(registry.begin_work("qa-1"));
    }

    #[test]
    fn test_known_roles_union() {
        let registry = AgentRegistry::new();
        registry.register(Persona::new("a", &["qa-engineer"], ""));
        registry.register(Persona::new("b", &["ceo", "qa-engineer"], ""));

        let roles = registry.known_roles();
        assert_eq!(roles.len(), 2);
        assert!(roles.contains("ceo"));
    }

    #[test]
    fn test_unknown_agent_cannot_work() {
        let registry = AgentRegistry::new();
        assert!(!registry.begin_work("ghost"));
        registry.finish_work("ghost");
        assert_eq!(registry.active_count("ghost"), 0);
    }
}
