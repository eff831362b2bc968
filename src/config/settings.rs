use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ArbiterError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub mtls_ca: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8700".to_string(),
            tls_cert: None,
            tls_key: None,
            mtls_ca: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub max_concurrent_per_persona: usize,
    pub heartbeat_interval_secs: u64,
    pub file_lock_timeout_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_persona: 1,
            heartbeat_interval_secs: 10,
            file_lock_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeadsConfig {
    pub storage_path: PathBuf,
}

impl Default for BeadsConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(".arbiter/beads"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    pub endpoint: String,
    /// Name of the secret in the credential store holding the API key.
    #[serde(default)]
    pub key_ref: Option<String>,
    pub model: String,
    pub params_b: f64,
    #[serde(default)]
    pub cost_per_mtoken: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    pub max_entries: usize,
    pub backend_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 3600,
            max_entries: 10_000,
            backend_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub id: String,
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Perpetual projects keep their dispatch loop alive even when the
    /// backlog drains.
    #[serde(default)]
    pub is_perpetual: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_keys: Vec<String>,
    pub enable_auth: bool,
    pub require_https: bool,
}

/// The single structured configuration document. Fatal validation errors
/// stop process startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub server: ServerConfig,
    pub agents: AgentsConfig,
    pub beads: BeadsConfig,
    pub providers: Vec<ProviderEntry>,
    pub cache: CacheConfig,
    pub projects: Vec<ProjectEntry>,
    pub security: SecurityConfig,
}

impl ArbiterConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| ArbiterError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;
        Ok(())
    }

    /// Checks the whole document at once so an operator sees every problem
    /// in a single pass.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address must not be empty".to_string());
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server.tls_cert and server.tls_key must be set together".to_string());
        }

        if self.agents.max_concurrent_per_persona == 0 {
            errors.push("agents.max_concurrent_per_persona must be greater than 0".to_string());
        }
        if self.agents.heartbeat_interval_secs == 0 {
            errors.push("agents.heartbeat_interval_secs must be greater than 0".to_string());
        }

        for provider in &self.providers {
            if provider.id.is_empty() {
                errors.push("provider id must not be empty".to_string());
            }
            if provider.endpoint.is_empty() {
                errors.push(format!("provider {} has no endpoint", provider.id));
            }
            if provider.model.is_empty() {
                errors.push(format!("provider {} has no model", provider.id));
            }
            if provider.params_b <= 0.0 {
                errors.push(format!("provider {} params_b must be positive", provider.id));
            }
            if provider.cost_per_mtoken < 0.0 {
                errors.push(format!("provider {} cost must not be negative", provider.id));
            }
        }

        let mut provider_ids: Vec<&str> = self.providers.iter().map(|p| p.id.as_str()).collect();
        provider_ids.sort_unstable();
        provider_ids.dedup();
        if provider_ids.len() != self.providers.len() {
            errors.push("provider ids must be unique".to_string());
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            errors.push("cache.max_entries must be greater than 0 when enabled".to_string());
        }

        for project in &self.projects {
            if project.id.is_empty() {
                errors.push("project id must not be empty".to_string());
            }
            if project.branch.is_empty() {
                errors.push(format!("project {} has no branch", project.id));
            }
        }

        if self.security.enable_auth && self.security.api_keys.is_empty() {
            errors.push("security.enable_auth requires at least one api key".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArbiterError::Config(errors.join("; ")))
        }
    }
}
