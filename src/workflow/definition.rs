use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::BeadContext;
use crate::error::{ArbiterError, Result};

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_FAILURE: &str = "failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Start,
    End,
    Task,
    Approval,
    Decision,
    Merge,
}

impl NodeType {
    /// Node types that an agent executes, and which therefore require a role.
    pub fn requires_role(&self) -> bool {
        matches!(self, Self::Task | Self::Approval | Self::Decision)
    }
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-attempt wall-clock deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    /// Commit-serialized nodes hold the project-wide lock while active.
    #[serde(default)]
    pub serialize: bool,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Optional predicate on an edge, evaluated against the bead context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeCondition {
    pub key: String,
    pub equals: String,
}

impl EdgeCondition {
    pub fn evaluate(&self, context: &BeadContext) -> bool {
        context.get(&self.key).as_deref() == Some(self.equals.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,
}

/// A directed acyclic graph of role-restricted nodes through which a bead
/// advances. Loaded from persisted JSON and validated before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowDefinition {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Start)
    }

    pub fn edges_from<'a, 'b>(&'a self, node_id: &'b str) -> impl Iterator<Item = &'a WorkflowEdge> + use<'a, 'b> {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    /// Validates the graph, reporting every failing rule at once.
    pub fn validate(&self, known_roles: &HashSet<String>) -> Result<()> {
        let mut errors = Vec::new();

        let start_count = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .count();
        if start_count != 1 {
            errors.push(format!("expected exactly one start node, found {}", start_count));
        }

        let end_count = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::End)
            .count();
        if end_count == 0 {
            errors.push("workflow has no end node".to_string());
        }

        let node_ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        if node_ids.len() != self.nodes.len() {
            errors.push("duplicate node ids".to_string());
        }

        for edge in &self.edges {
            if !node_ids.contains(edge.from.as_str()) {
                errors.push(format!("edge references unknown node {}", edge.from));
            }
            if !node_ids.contains(edge.to.as_str()) {
                errors.push(format!("edge references unknown node {}", edge.to));
            }
        }

        for node in &self.nodes {
            match &node.role {
                Some(role) if !known_roles.contains(role) => {
                    errors.push(format!("node {} declares unknown role {}", node.id, role));
                }
                None if node.node_type.requires_role() => {
                    errors.push(format!("node {} requires a role", node.id));
                }
                _ => {}
            }
        }

        if let Some(cycle) = self.find_cycle() {
            errors.push(format!("workflow contains a cycle: {}", cycle.join(" -> ")));
        }

        if let Some(unreachable) = self.unreachable_nodes() {
            errors.push(format!("unreachable nodes: {}", unreachable.join(", ")));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArbiterError::WorkflowValidation(errors.join("; ")))
        }
    }

    /// DFS with color marking over forward-progress edges. White = unvisited,
    /// gray = on stack, black = done; a gray-to-gray edge closes a cycle.
    /// Failure edges are retry back-edges and may legitimately point at an
    /// earlier node, so they are not followed here.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), Color::White))
            .collect();
        let mut path = Vec::new();

        fn dfs<'a>(
            node: &'a str,
            def: &'a WorkflowDefinition,
            colors: &mut HashMap<&'a str, Color>,
            path: &mut Vec<String>,
        ) -> bool {
            match colors.get(node) {
                Some(Color::Gray) => {
                    path.push(node.to_string());
                    return true;
                }
                Some(Color::Black) | None => return false,
                Some(Color::White) => {}
            }

            colors.insert(node, Color::Gray);
            path.push(node.to_string());

            for edge in def.edges_from(node) {
                if edge.outcome == OUTCOME_FAILURE {
                    continue;
                }
                if dfs(&edge.to, def, colors, path) {
                    return true;
                }
            }

            colors.insert(node, Color::Black);
            path.pop();
            false
        }

        for node in &self.nodes {
            if colors.get(node.id.as_str()) == Some(&Color::White)
                && dfs(&node.id, self, &mut colors, &mut path)
            {
                return Some(path);
            }
        }
        None
    }

    fn unreachable_nodes(&self) -> Option<Vec<String>> {
        let start = self.start_node()?;

        let mut reachable: HashSet<&str> = HashSet::new();
        let mut stack = vec![start.id.as_str()];
        while let Some(node) = stack.pop() {
            if !reachable.insert(node) {
                continue;
            }
            for edge in self.edges_from(node) {
                stack.push(&edge.to);
            }
        }

        let unreachable: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !reachable.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect();
        if unreachable.is_empty() {
            None
        } else {
            Some(unreachable)
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::HashSet;

    pub fn known_roles() -> HashSet<String> {
        ["qa-engineer", "backend-engineer", "engineering-manager", "ceo"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn bug_workflow_json() -> &'static str {
        r#"{
          "id": "auto-bug-workflow",
          "name": "Automated bug workflow",
          "nodes": [
            {"id":"start","type":"start"},
            {"id":"triage","type":"task","role":"qa-engineer","max_attempts":1,"timeout_s":300},
            {"id":"investigate","type":"task","role":"backend-engineer","max_attempts":5,"timeout_s":1800},
            {"id":"approve","type":"approval","role":"ceo"},
            {"id":"apply","type":"task","role":"engineering-manager","max_attempts":3,"timeout_s":600,"serialize":true},
            {"id":"verify","type":"task","role":"qa-engineer","max_attempts":2,"timeout_s":600},
            {"id":"end","type":"end"}
          ],
          "edges": [
            {"from":"start","to":"triage","outcome":"success"},
            {"from":"triage","to":"investigate","outcome":"success"},
            {"from":"investigate","to":"approve","outcome":"success"},
            {"from":"approve","to":"apply","outcome":"success"},
            {"from":"approve","to":"end","outcome":"reject"},
            {"from":"apply","to":"verify","outcome":"success"},
            {"from":"verify","to":"end","outcome":"success"},
            {"from":"verify","to":"apply","outcome":"failure"}
          ]
        }"#
    }
}
